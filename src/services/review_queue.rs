//! 审核队列 - 业务能力层
//!
//! 文件后端的持久队列：没走到可信终态的会话连同取证上下文
//! 落进 `pending/`，人工处理后迁到 `reviewed/`。条目只迁移、不删除，
//! 队列目录可以直接用肉眼和文本工具检查。
//!
//! ## 职责
//! - 入队 / 列表 / 裁决，三个动作之外不提供任何操作
//! - 迁移用 rename 完成，天然是"检查并占有"的原子步骤
//! - 不认识状态机，只认识冻结后的 SessionContext

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, ConfigError, QueueError};
use crate::workflow::session_context::SessionContext;

/// 人工裁决标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionTag {
    /// 已修复（例如选择器已更新，下轮会成功）
    Fixed,
    /// 人工补录了数据
    ManualFix,
    /// 本次放弃
    Skip,
    /// 门户永久拉黑
    PermanentBlock,
}

impl std::str::FromStr for ResolutionTag {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(ResolutionTag::Fixed),
            "manual-fix" => Ok(ResolutionTag::ManualFix),
            "skip" => Ok(ResolutionTag::Skip),
            "permanent-block" => Ok(ResolutionTag::PermanentBlock),
            other => Err(AppError::Config(ConfigError::InvalidArgument {
                name: "tag".to_string(),
                value: other.to_string(),
                reason: "可选值: fixed | manual-fix | skip | permanent-block".to_string(),
            })),
        }
    }
}

impl std::fmt::Display for ResolutionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionTag::Fixed => "fixed",
            ResolutionTag::ManualFix => "manual-fix",
            ResolutionTag::Skip => "skip",
            ResolutionTag::PermanentBlock => "permanent-block",
        };
        write!(f, "{}", s)
    }
}

/// 一次人工裁决
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub tag: ResolutionTag,
    pub notes: String,
    pub resolved_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Pending,
    Reviewed,
}

/// 队列条目：冻结的会话上下文 + 队列元数据
///
/// 截图不进 JSON，以同键名的 `_snapN.png` 旁置文件存放。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: String,
    pub enqueued_at: String,
    /// 入队原因（分类器给出的 needs-review 理由）
    pub reason: String,
    pub status: QueueStatus,
    pub resolution: Option<Resolution>,
    pub context: SessionContext,
}

/// 审核队列
pub struct ReviewQueue {
    root: PathBuf,
}

impl ReviewQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    fn reviewed_dir(&self) -> PathBuf {
        self.root.join("reviewed")
    }

    /// 建好 pending/ 与 reviewed/ 两个目录
    pub async fn ensure_layout(&self) -> AppResult<()> {
        for dir in [self.pending_dir(), self.reviewed_dir()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| AppError::queue_storage_failed(&dir, e))?;
        }
        Ok(())
    }

    /// 入队：生成带时间戳的键，写 JSON + 旁置截图
    ///
    /// 存储错误原样向上传递，不降级为警告。
    pub async fn enqueue(&self, context: &SessionContext, reason: &str) -> AppResult<QueueEntry> {
        self.ensure_layout().await?;

        let key = format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S%3f"),
            context.target_id
        );

        let entry = QueueEntry {
            key: key.clone(),
            enqueued_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            reason: reason.to_string(),
            status: QueueStatus::Pending,
            resolution: None,
            context: context.clone(),
        };

        let json = serde_json::to_string_pretty(&entry)?;
        let entry_path = self.pending_dir().join(format!("{}.json", key));
        fs::write(&entry_path, json)
            .await
            .map_err(|e| AppError::queue_storage_failed(&entry_path, e))?;

        for (i, png) in context.snapshots.iter().enumerate() {
            let snap_path = self.pending_dir().join(format!("{}_snap{}.png", key, i));
            fs::write(&snap_path, png)
                .await
                .map_err(|e| AppError::queue_storage_failed(&snap_path, e))?;
        }

        info!(
            "📥 已入队待审核: {} (原因: {}, 截图 {} 张)",
            key,
            reason,
            context.snapshots.len()
        );
        Ok(entry)
    }

    /// 待审核条目，按键排序（键前缀是时间戳，即最旧在前）
    pub async fn list_pending(&self, limit: Option<usize>) -> AppResult<Vec<QueueEntry>> {
        self.list_dir(self.pending_dir(), limit).await
    }

    /// 已审核条目，同样最旧在前
    pub async fn list_reviewed(&self, limit: Option<usize>) -> AppResult<Vec<QueueEntry>> {
        self.list_dir(self.reviewed_dir(), limit).await
    }

    /// 裁决一个待审核条目
    ///
    /// 用 rename 把 JSON 从 pending/ 迁到 reviewed/ 作为占有动作：
    /// 两个并发裁决者只会有一个 rename 成功，输家得到 AlreadyResolved。
    pub async fn resolve(
        &self,
        key: &str,
        tag: ResolutionTag,
        notes: &str,
    ) -> AppResult<QueueEntry> {
        let pending_path = self.pending_dir().join(format!("{}.json", key));
        let reviewed_path = self.reviewed_dir().join(format!("{}.json", key));

        let content = match fs::read_to_string(&pending_path).await {
            Ok(c) => c,
            Err(_) => {
                if fs::try_exists(&reviewed_path).await.unwrap_or(false) {
                    return Err(AppError::Queue(QueueError::AlreadyResolved {
                        key: key.to_string(),
                    }));
                }
                return Err(AppError::Queue(QueueError::EntryNotFound {
                    key: key.to_string(),
                }));
            }
        };
        let mut entry: QueueEntry = serde_json::from_str(&content)?;

        // 占有动作：rename 失败且目标已在 reviewed/ = 别人先到了
        if let Err(e) = fs::rename(&pending_path, &reviewed_path).await {
            if fs::try_exists(&reviewed_path).await.unwrap_or(false) {
                return Err(AppError::Queue(QueueError::AlreadyResolved {
                    key: key.to_string(),
                }));
            }
            return Err(AppError::queue_storage_failed(&pending_path, e));
        }

        entry.status = QueueStatus::Reviewed;
        entry.resolution = Some(Resolution {
            tag,
            notes: notes.to_string(),
            resolved_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        });

        let json = serde_json::to_string_pretty(&entry)?;
        fs::write(&reviewed_path, json)
            .await
            .map_err(|e| AppError::queue_storage_failed(&reviewed_path, e))?;

        self.move_snapshots(key).await;

        info!("✅ 条目 {} 已裁决: {}", key, tag);
        Ok(entry)
    }

    /// 旁置截图跟随 JSON 迁移；失败只告警，不影响裁决本身
    async fn move_snapshots(&self, key: &str) {
        let prefix = format!("{}_snap", key);
        let mut entries = match fs::read_dir(self.pending_dir()).await {
            Ok(e) => e,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) {
                let dest = self.reviewed_dir().join(&name);
                if let Err(e) = fs::rename(entry.path(), &dest).await {
                    warn!("截图迁移失败 {}: {}", name, e);
                }
            }
        }
    }

    async fn list_dir(&self, dir: PathBuf, limit: Option<usize>) -> AppResult<Vec<QueueEntry>> {
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| AppError::queue_storage_failed(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::queue_storage_failed(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                names.push(path);
            }
        }
        names.sort();
        if let Some(limit) = limit {
            names.truncate(limit);
        }

        let mut result = Vec::new();
        for path in names {
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<QueueEntry>(&content) {
                    Ok(entry) => result.push(entry),
                    Err(e) => warn!("队列条目解析失败 {}: {}", path.display(), e),
                },
                Err(e) => warn!("队列条目读取失败 {}: {}", path.display(), e),
            }
        }
        debug!("列出 {} 个队列条目 ({})", result.len(), dir.display());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::session_context::SessionOutcome;

    fn failed_context(target_id: &str) -> SessionContext {
        let mut ctx = SessionContext::new(target_id, "task");
        ctx.record_action("navigate");
        ctx.record_step_error("navigation timed out");
        ctx.finish(SessionOutcome::Failed);
        ctx
    }

    #[tokio::test]
    async fn test_enqueue_then_list_pending() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path());

        let entry = queue
            .enqueue(&failed_context("mesa-az"), "会话失败")
            .await
            .unwrap();
        assert!(entry.key.ends_with("_mesa-az"));

        let pending = queue.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].context.target_id, "mesa-az");
        assert_eq!(pending[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_resolve_moves_entry_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path());

        let entry = queue
            .enqueue(&failed_context("tempe-az"), "审核")
            .await
            .unwrap();

        let resolved = queue
            .resolve(&entry.key, ResolutionTag::ManualFix, "手工补录了 3 条")
            .await
            .unwrap();
        assert_eq!(resolved.status, QueueStatus::Reviewed);
        let resolution = resolved.resolution.unwrap();
        assert_eq!(resolution.tag, ResolutionTag::ManualFix);
        assert_eq!(resolution.notes, "手工补录了 3 条");

        assert!(queue.list_pending(None).await.unwrap().is_empty());
        let reviewed = queue.list_reviewed(None).await.unwrap();
        assert_eq!(reviewed.len(), 1);

        // 第二次裁决必须明确报错，不能静默成功
        let second = queue
            .resolve(&entry.key, ResolutionTag::Skip, "")
            .await;
        assert!(matches!(
            second,
            Err(AppError::Queue(QueueError::AlreadyResolved { .. }))
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path());
        queue.ensure_layout().await.unwrap();

        let result = queue.resolve("no_such_key", ResolutionTag::Skip, "").await;
        assert!(matches!(
            result,
            Err(AppError::Queue(QueueError::EntryNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_list_pending_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path());

        queue.enqueue(&failed_context("first"), "r").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue.enqueue(&failed_context("second"), "r").await.unwrap();

        let pending = queue.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].context.target_id, "first");
        assert_eq!(pending[1].context.target_id, "second");

        let limited = queue.list_pending(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].context.target_id, "first");
    }

    #[tokio::test]
    async fn test_snapshots_follow_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path());

        let mut ctx = failed_context("glendale-az");
        ctx.push_snapshot(vec![0x89, 0x50, 0x4e, 0x47], 3);
        let entry = queue.enqueue(&ctx, "带截图").await.unwrap();

        let snap = dir
            .path()
            .join("pending")
            .join(format!("{}_snap0.png", entry.key));
        assert!(snap.exists());

        queue
            .resolve(&entry.key, ResolutionTag::Fixed, "")
            .await
            .unwrap();
        let moved = dir
            .path()
            .join("reviewed")
            .join(format!("{}_snap0.png", entry.key));
        assert!(moved.exists());
        assert!(!snap.exists());
    }
}
