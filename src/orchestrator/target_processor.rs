//! 单个目标处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块负责一个门户目标从会话到落盘的完整管线，是目标级别的编排器。
//!
//! ## 核心功能
//!
//! 1. **会话执行**：驱动 `SessionMachine` 跑完整个门户会话
//! 2. **结果分类**：交给 classifier 判定 trusted / needs-review
//! 3. **双路落盘**：可信记录进结果流，存疑会话进审核队列
//! 4. **运行日志**：无论结局，目标完成后追加一行 run log
//! 5. **异常兜底**：工作器 panic / page 创建失败也要留下队列条目

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::classifier::{self, ClassifiedResult};
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::PortalDriver;
use crate::models::target::Target;
use crate::services::backend::ExtractionBackend;
use crate::services::result_sink::{ResultSink, RunLogLine};
use crate::services::review_queue::ReviewQueue;
use crate::workflow::session_context::SessionContext;
use crate::workflow::session_machine::SessionMachine;

/// 单个目标的处理结果，供批次汇总
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target_id: String,
    pub portal_name: String,
    /// 分类结论: trusted-success | needs-review
    pub classification: String,
    /// 写入结果流的记录数
    pub accepted: usize,
    /// 可信度过滤丢弃的记录数
    pub rejected: u32,
    /// needs-review 时的队列键
    pub review_key: Option<String>,
}

impl TargetReport {
    pub fn is_trusted(&self) -> bool {
        self.review_key.is_none()
    }
}

/// 处理单个目标
///
/// # 参数
/// - `driver`: 门户驱动（独占一个 page）
/// - `target`: 目标计划
/// - `target_index`: 批次内序号（用于日志）
/// - `config`: 配置
/// - `backend`: 提取后端
/// - `queue`: 审核队列
/// - `sink`: 结果落盘
///
/// # 返回
/// 只有存储层失败才返回 Err；会话本身的失败体现在报告里
pub async fn process_target(
    driver: &dyn PortalDriver,
    target: &Target,
    target_index: usize,
    config: &Config,
    backend: Arc<dyn ExtractionBackend>,
    queue: &ReviewQueue,
    sink: &ResultSink,
) -> AppResult<TargetReport> {
    log_target_start(target_index, target);

    // 跑会话：状态机永不抛错，一切都冻结在 ctx 里
    let machine = SessionMachine::new(config, backend, target_index);
    let ctx = machine.run(driver, target).await;

    // 分类并双路落盘
    let classified = classifier::classify(&ctx, target);
    let label = classified.label();
    let report = match classified {
        ClassifiedResult::TrustedSuccess { records } => {
            let accepted = sink.append_records(&target.id, &records)?;
            info!(
                "[目标 {}] 📤 可信结果已落盘: {} 条",
                target_index, accepted
            );
            TargetReport {
                target_id: target.id.clone(),
                portal_name: target.portal_name.clone(),
                classification: label.to_string(),
                accepted,
                rejected: ctx.rejected_count,
                review_key: None,
            }
        }
        ClassifiedResult::NeedsReview { reason } => {
            let entry = queue.enqueue(&ctx, &reason).await?;
            warn!(
                "[目标 {}] 📥 会话存疑，已入队: {} (原因: {})",
                target_index, entry.key, reason
            );
            TargetReport {
                target_id: target.id.clone(),
                portal_name: target.portal_name.clone(),
                classification: label.to_string(),
                accepted: 0,
                rejected: ctx.rejected_count,
                review_key: Some(entry.key),
            }
        }
    };

    append_run_line(sink, &ctx, &report, None)?;

    log_target_complete(target_index, &report);
    Ok(report)
}

/// 工作器异常兜底：连会话都没跑完（page 创建失败 / 任务 panic）
///
/// 合成一个未收束的上下文入队，并照常写 run log，
/// 保证"每个目标恰好一行运行日志"的约定在异常路径上也成立。
pub async fn report_worker_failure(
    target: &Target,
    target_index: usize,
    detail: &str,
    queue: &ReviewQueue,
    sink: &ResultSink,
) -> AppResult<TargetReport> {
    error!("[目标 {}] ❌ 工作器异常: {}", target_index, detail);

    let mut ctx = SessionContext::new(&target.id, target.task_description());
    ctx.record_action("worker");
    ctx.record_step_error(format!("工作器异常: {}", detail));

    let reason = format!("工作器异常: {}", detail);
    let entry = queue.enqueue(&ctx, &reason).await?;

    let report = TargetReport {
        target_id: target.id.clone(),
        portal_name: target.portal_name.clone(),
        classification: "needs-review".to_string(),
        accepted: 0,
        rejected: 0,
        review_key: Some(entry.key),
    };
    append_run_line(sink, &ctx, &report, Some(detail))?;
    Ok(report)
}

fn append_run_line(
    sink: &ResultSink,
    ctx: &SessionContext,
    report: &TargetReport,
    error: Option<&str>,
) -> AppResult<()> {
    sink.append_run_line(&RunLogLine {
        target_id: report.target_id.clone(),
        portal_name: report.portal_name.clone(),
        finished_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        outcome: ctx.outcome,
        classification: report.classification.clone(),
        accepted: report.accepted,
        rejected: report.rejected,
        review_key: report.review_key.clone(),
        error: error.map(String::from),
    })
}

// ========== 日志辅助函数 ==========

fn log_target_start(target_index: usize, target: &Target) {
    info!("\n[目标 {}] {}", target_index, "─".repeat(30));
    info!("[目标 {}] 开始处理", target_index);
    info!("[目标 {}] 门户: {}", target_index, target.portal_name);
    info!("[目标 {}] ID: {}", target_index, target.id);
    if let Some(criteria) = &target.criteria {
        info!("[目标 {}] 检索条件: {}", target_index, criteria.describe());
    }
}

fn log_target_complete(target_index: usize, report: &TargetReport) {
    if report.is_trusted() {
        info!(
            "[目标 {}] ✅ 目标处理完成: 可信, 落盘 {} 条\n",
            target_index, report.accepted
        );
    } else {
        info!(
            "[目标 {}] 📥 目标处理完成: 待审核 (丢弃 {} 条)\n",
            target_index, report.rejected
        );
    }
}
