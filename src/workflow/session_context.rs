//! 会话上下文
//!
//! 一次门户抓取尝试的完整取证记录：走过哪些 URL、做过哪些动作、
//! 每步出了什么错、最终停在什么状态。由所属状态机独占修改，
//! 会话结束后冻结，进审核队列时原样持久化。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::record::ExtractedRecord;

/// 会话终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    /// 正常完成且至少吸收一条记录（或达到配额）
    Success,
    /// 正常走完但一条记录都没有
    Exhausted,
    /// 被不可恢复错误终止
    Failed,
}

/// 会话上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// 目标标识
    pub target_id: String,

    /// 提取任务描述
    pub task: String,

    /// 按访问顺序记录的 URL
    pub visited_urls: Vec<String>,

    /// 按执行顺序记录的动作名
    pub actions: Vec<String>,

    /// 与 actions 等长的逐步错误槽；None = 该步无错
    pub step_errors: Vec<Option<String>>,

    /// 最后一次提取的原始输出（后端回复或 DOM 负载，可能不可解析）
    pub raw_final_output: Option<String>,

    /// 终态；None = 会话未走完
    pub outcome: Option<SessionOutcome>,

    /// 已吸收（去重后）的记录
    pub records: Vec<ExtractedRecord>,

    /// 被可信度过滤丢弃的记录数
    pub rejected_count: u32,

    /// 关键时点的 PNG 截图，最新在前，数量有界；不入 JSON
    #[serde(skip)]
    pub snapshots: Vec<Vec<u8>>,

    pub started_at: String,

    pub finished_at: Option<String>,
}

impl SessionContext {
    pub fn new(target_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            task: task.into(),
            visited_urls: Vec::new(),
            actions: Vec::new(),
            step_errors: Vec::new(),
            raw_final_output: None,
            outcome: None,
            records: Vec::new(),
            rejected_count: 0,
            snapshots: Vec::new(),
            started_at: now_stamp(),
            finished_at: None,
        }
    }

    /// 记录一个动作，同时开一个空错误槽
    pub fn record_action(&mut self, action: impl Into<String>) {
        self.actions.push(action.into());
        self.step_errors.push(None);
    }

    /// 把错误记到最近一个动作的槽位上
    ///
    /// 没有任何动作时补一个占位动作，保证两个序列始终等长。
    pub fn record_step_error(&mut self, error: impl Into<String>) {
        match self.step_errors.last_mut() {
            Some(slot) => *slot = Some(error.into()),
            None => {
                self.actions.push("unplanned".to_string());
                self.step_errors.push(Some(error.into()));
            }
        }
    }

    pub fn record_url(&mut self, url: impl Into<String>) {
        self.visited_urls.push(url.into());
    }

    /// 吸收一页提取结果，按 permit_id（缺失时退回 address）去重
    ///
    /// 返回真正新增的条数；同一页读两遍不会让累计翻倍。
    pub fn absorb_records(&mut self, incoming: Vec<ExtractedRecord>) -> usize {
        let mut seen: HashSet<String> = self
            .records
            .iter()
            .filter_map(|r| r.dedup_key())
            .collect();

        let mut added = 0;
        for record in incoming {
            match record.dedup_key() {
                Some(key) => {
                    if seen.insert(key) {
                        self.records.push(record);
                        added += 1;
                    }
                }
                None => {
                    // 无去重键的记录只能照单全收
                    self.records.push(record);
                    added += 1;
                }
            }
        }
        added
    }

    /// 留存一张截图，最新在前，超出上限丢最旧的
    pub fn push_snapshot(&mut self, png: Vec<u8>, max_snapshots: usize) {
        self.snapshots.insert(0, png);
        self.snapshots.truncate(max_snapshots);
    }

    /// 收束会话：写终态和结束时间
    pub fn finish(&mut self, outcome: SessionOutcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(now_stamp());
    }

    /// 三态成功标志：None = 未走完
    pub fn success(&self) -> Option<bool> {
        self.outcome.map(|o| o == SessionOutcome::Success)
    }

    pub fn has_step_errors(&self) -> bool {
        self.step_errors.iter().any(Option::is_some)
    }
}

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record_with_id(id: &str) -> ExtractedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("permit_id".to_string(), id.to_string());
        ExtractedRecord::new(fields)
    }

    #[test]
    fn test_actions_and_error_slots_stay_aligned() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        ctx.record_action("navigate");
        ctx.record_action("submit");
        ctx.record_step_error("timeout");
        ctx.record_action("paginate");

        assert_eq!(ctx.actions.len(), ctx.step_errors.len());
        assert_eq!(ctx.step_errors[1].as_deref(), Some("timeout"));
        assert!(ctx.step_errors[0].is_none());
        assert!(ctx.step_errors[2].is_none());
    }

    #[test]
    fn test_step_error_without_action_keeps_invariant() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        ctx.record_step_error("orphan");

        assert_eq!(ctx.actions.len(), 1);
        assert_eq!(ctx.step_errors.len(), 1);
        assert_eq!(ctx.actions[0], "unplanned");
    }

    #[test]
    fn test_absorb_same_page_twice_does_not_double() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        let page = vec![record_with_id("A-1"), record_with_id("A-2")];

        assert_eq!(ctx.absorb_records(page.clone()), 2);
        assert_eq!(ctx.absorb_records(page), 0);
        assert_eq!(ctx.records.len(), 2);
    }

    #[test]
    fn test_absorb_falls_back_to_address_key() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        let mut fields = BTreeMap::new();
        fields.insert("address".to_string(), "77 W Thomas Rd".to_string());
        let rec = ExtractedRecord::new(fields);

        assert_eq!(ctx.absorb_records(vec![rec.clone()]), 1);
        assert_eq!(ctx.absorb_records(vec![rec]), 0);
    }

    #[test]
    fn test_snapshot_bound_keeps_newest() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        ctx.push_snapshot(vec![1], 2);
        ctx.push_snapshot(vec![2], 2);
        ctx.push_snapshot(vec![3], 2);

        assert_eq!(ctx.snapshots.len(), 2);
        assert_eq!(ctx.snapshots[0], vec![3]);
        assert_eq!(ctx.snapshots[1], vec![2]);
    }

    #[test]
    fn test_success_flag_tri_state() {
        let mut ctx = SessionContext::new("mesa-az", "task");
        assert_eq!(ctx.success(), None);

        ctx.finish(SessionOutcome::Exhausted);
        assert_eq!(ctx.success(), Some(false));

        let mut ctx = SessionContext::new("mesa-az", "task");
        ctx.finish(SessionOutcome::Success);
        assert_eq!(ctx.success(), Some(true));
    }
}
