//! 结果分类器
//!
//! 纯函数：(冻结的会话上下文, 目标) → 可信 | 待审核。
//! 立场是悲观的，任何歧义都进审核队列，可疑数据不进结果流。
//! 同一输入分类多少次都得到同一结论。

use crate::models::record::ExtractedRecord;
use crate::models::target::Target;
use crate::services::plausibility;
use crate::workflow::session_context::{SessionContext, SessionOutcome};

/// 分类结论
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedResult {
    /// 结果可信，记录可直接落盘
    TrustedSuccess { records: Vec<ExtractedRecord> },
    /// 需人工审核，带原因
    NeedsReview { reason: String },
}

impl ClassifiedResult {
    pub fn is_trusted(&self) -> bool {
        matches!(self, ClassifiedResult::TrustedSuccess { .. })
    }

    /// 进运行日志的标签
    pub fn label(&self) -> &'static str {
        match self {
            ClassifiedResult::TrustedSuccess { .. } => "trusted-success",
            ClassifiedResult::NeedsReview { .. } => "needs-review",
        }
    }
}

/// 分类一个已收束的会话
///
/// 可信的充要条件：终态 success、至少一条记录、每条记录重过一遍
/// 可信度过滤、全程无步骤错误。唯一的例外：显式零结果预期的目标
/// （配额为 None 或 Some(0)）干净地穷尽时，按可信空结果处理。
pub fn classify(ctx: &SessionContext, target: &Target) -> ClassifiedResult {
    match ctx.outcome {
        None => needs_review("会话未走完即被中断".to_string()),

        Some(SessionOutcome::Failed) => {
            let detail = first_step_error(ctx).unwrap_or("无错误详情");
            needs_review(format!("会话失败: {}", detail))
        }

        Some(SessionOutcome::Exhausted) => {
            if ctx.has_step_errors() {
                let detail = first_step_error(ctx).unwrap_or("未知");
                return needs_review(format!("零记录且过程有步骤错误: {}", detail));
            }
            if target.has_positive_quota() {
                let quota = target.quota.unwrap_or(0);
                return needs_review(format!("配额 {} 未达成，会话零记录", quota));
            }
            // 显式零结果预期：干净穷尽即算数
            ClassifiedResult::TrustedSuccess {
                records: Vec::new(),
            }
        }

        Some(SessionOutcome::Success) => {
            if ctx.records.is_empty() {
                return needs_review("终态成功但记录为空".to_string());
            }
            if ctx.has_step_errors() {
                let detail = first_step_error(ctx).unwrap_or("未知");
                return needs_review(format!("过程有步骤错误: {}", detail));
            }
            // 不分提取策略，可信结论前每条记录都重过一遍过滤
            for record in &ctx.records {
                if let Some(why) = plausibility::rejection_reason(record) {
                    return needs_review(format!(
                        "记录未过可信度复检 ({}): id={:?}",
                        why,
                        record.permit_id()
                    ));
                }
            }
            ClassifiedResult::TrustedSuccess {
                records: ctx.records.clone(),
            }
        }
    }
}

fn needs_review(reason: String) -> ClassifiedResult {
    ClassifiedResult::NeedsReview { reason }
}

fn first_step_error(ctx: &SessionContext) -> Option<&str> {
    ctx.step_errors
        .iter()
        .find_map(|slot| slot.as_deref())
}
