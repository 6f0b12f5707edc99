//! 结果落盘 - 业务能力层
//!
//! 两条只追加的 JSONL 流：`permits.jsonl` 每条可信记录一行，
//! `run_log.jsonl` 每个完成的目标一行（无论结局）。
//! 每次写入都是"打开-追加-关闭"一整行，从不跨 await 持有文件句柄，
//! 多个工作器并发追加时行内永不交错。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::record::ExtractedRecord;
use crate::workflow::session_context::SessionOutcome;

/// permits.jsonl 的行外形
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLine {
    pub target_id: String,
    pub extracted_at: String,
    pub record: ExtractedRecord,
}

/// run_log.jsonl 的行外形
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogLine {
    pub target_id: String,
    pub portal_name: String,
    pub finished_at: String,
    /// 终态；工作器异常时为 None
    pub outcome: Option<SessionOutcome>,
    /// 分类结论: trusted-success | needs-review
    pub classification: String,
    pub accepted: usize,
    pub rejected: u32,
    /// needs-review 时对应的队列键
    pub review_key: Option<String>,
    /// 工作器异常文本
    pub error: Option<String>,
}

/// 结果落盘服务
pub struct ResultSink {
    records_path: PathBuf,
    run_log_path: PathBuf,
}

impl ResultSink {
    pub fn new(records_path: impl Into<PathBuf>, run_log_path: impl Into<PathBuf>) -> Self {
        Self {
            records_path: records_path.into(),
            run_log_path: run_log_path.into(),
        }
    }

    /// 追加一批可信记录，每条一行；返回写入条数
    pub fn append_records(
        &self,
        target_id: &str,
        records: &[ExtractedRecord],
    ) -> AppResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut buffer = String::new();
        for record in records {
            let line = RecordLine {
                target_id: target_id.to_string(),
                extracted_at: stamp.clone(),
                record: record.clone(),
            };
            buffer.push_str(&serde_json::to_string(&line)?);
            buffer.push('\n');
        }

        append_all(&self.records_path, buffer.as_bytes())?;
        debug!("📤 {} 条记录已写入 {}", records.len(), self.records_path.display());
        Ok(records.len())
    }

    /// 追加一行运行日志
    pub fn append_run_line(&self, line: &RunLogLine) -> AppResult<()> {
        let mut text = serde_json::to_string(line)?;
        text.push('\n');
        append_all(&self.run_log_path, text.as_bytes())?;
        Ok(())
    }
}

/// 打开-追加-关闭，一次写完整个缓冲
fn append_all(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::file_write_failed(path, e))?;
    file.write_all(bytes)
        .map_err(|e| AppError::file_write_failed(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(id: &str) -> ExtractedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("permit_id".to_string(), id.to_string());
        fields.insert("address".to_string(), "4102 E Campbell Ave".to_string());
        ExtractedRecord::new(fields)
    }

    #[test]
    fn test_append_records_one_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("permits.jsonl"), dir.path().join("run.jsonl"));

        let wrote = sink
            .append_records("mesa-az", &[record("A-1"), record("A-2")])
            .unwrap();
        assert_eq!(wrote, 2);

        let content = std::fs::read_to_string(dir.path().join("permits.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: RecordLine = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.target_id, "mesa-az");
        assert_eq!(parsed.record.permit_id(), Some("A-1"));
    }

    #[test]
    fn test_append_is_cumulative() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("permits.jsonl"), dir.path().join("run.jsonl"));

        sink.append_records("a", &[record("1")]).unwrap();
        sink.append_records("b", &[record("2")]).unwrap();

        let content = std::fs::read_to_string(dir.path().join("permits.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_run_line_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("permits.jsonl"), dir.path().join("run.jsonl"));

        sink.append_run_line(&RunLogLine {
            target_id: "mesa-az".to_string(),
            portal_name: "Mesa Permit Center".to_string(),
            finished_at: "2026-08-23 10:00:00".to_string(),
            outcome: Some(SessionOutcome::Failed),
            classification: "needs-review".to_string(),
            accepted: 0,
            rejected: 1,
            review_key: Some("20260823_100000123_mesa-az".to_string()),
            error: None,
        })
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("run.jsonl")).unwrap();
        let parsed: RunLogLine = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.outcome, Some(SessionOutcome::Failed));
        assert_eq!(parsed.classification, "needs-review");
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("permits.jsonl"), dir.path().join("run.jsonl"));

        assert_eq!(sink.append_records("x", &[]).unwrap(), 0);
        assert!(!dir.path().join("permits.jsonl").exists());
    }
}
