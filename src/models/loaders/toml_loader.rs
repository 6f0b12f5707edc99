use crate::models::target::{ExtractionPolicy, SearchCriteria, Target};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从单个 TOML 文件加载一个门户目标
pub async fn load_target(toml_file_path: &Path) -> Result<Target> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let target: Target = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    Ok(target)
}

/// 从文件夹加载全部门户目标，并盖上本次运行的检索条件
///
/// 单个文件解析失败只告警跳过，不中断整批；
/// 结构不完整的目标（结构化策略缺行计划、要求登录缺登录计划）同样跳过。
/// 返回顺序按文件名排序，保证批次顺序可复现。
pub async fn load_all_targets(
    folder_path: &str,
    criteria: Option<&SearchCriteria>,
) -> Result<Vec<Target>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut targets = Vec::new();
    for path in &toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_target(path).await {
            Ok(mut target) => {
                if let Some(reason) = validate_target(&target) {
                    tracing::warn!("跳过目标 {} ({}): {}", target.id, path.display(), reason);
                    continue;
                }
                target.criteria = criteria.cloned();
                tracing::info!("成功加载目标: {} ({})", target.id, target.portal_name);
                targets.push(target);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(targets)
}

/// 目标完整性检查，返回 Some(原因) 表示不可用
fn validate_target(target: &Target) -> Option<String> {
    if target.id.trim().is_empty() {
        return Some("id 为空".to_string());
    }
    if target.policy == ExtractionPolicy::Structured && target.rows.is_none() {
        return Some("结构化策略缺少 [rows] 行计划".to_string());
    }
    if target.requires_auth && target.auth.is_none() {
        return Some("requires_auth = true 但缺少 [auth] 登录计划".to_string());
    }
    None
}
