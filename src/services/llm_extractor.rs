//! 自然语言提取 - 业务能力层
//!
//! 把一页门户文本送进提取后端，再把后端的自由格式回复
//! 宽容地解析成统一记录。解析不动摇：任何不可解析的回复
//! 都等价于"本页零记录"，绝不让一次坏回复拖垮会话。

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::models::record::ExtractedRecord;
use crate::services::backend::{ExtractionBackend, ExtractionRequest};

/// 一页自然语言提取的产出
#[derive(Debug, Clone)]
pub struct LlmPageExtract {
    /// 解析出的记录（未过可信度过滤）
    pub records: Vec<ExtractedRecord>,
    /// 后端原始回复，留作取证
    pub raw_response: String,
}

/// 自然语言提取器
pub struct LlmExtractor {
    backend: Arc<dyn ExtractionBackend>,
    text_cap: usize,
}

impl LlmExtractor {
    pub fn new(backend: Arc<dyn ExtractionBackend>, text_cap: usize) -> Self {
        Self { backend, text_cap }
    }

    pub fn backend_name(&self) -> String {
        self.backend.describe()
    }

    /// 提取一页：清洗文本 → 调后端 → 宽容解析
    ///
    /// 后端调用失败会向上传递（由状态机按"本页零记录 + 步骤错误"吸收）；
    /// 回复解析失败不算错误，返回空记录列表。
    pub async fn extract_page(
        &self,
        task: &str,
        raw_page_text: &str,
        prior_context: Option<String>,
    ) -> AppResult<LlmPageExtract> {
        let cleaned = clean_page_text(raw_page_text, self.text_cap);
        debug!(
            "页面文本清洗完成: {} -> {} 字符",
            raw_page_text.len(),
            cleaned.len()
        );

        let request = ExtractionRequest {
            task: task.to_string(),
            page_text: cleaned,
            prior_context,
        };

        let raw_response = self.backend.extract(&request).await?;
        let records = parse_backend_response(&raw_response);

        if records.is_empty() && !raw_response.is_empty() {
            debug!("后端回复未解析出任何记录: {}", truncate_for_log(&raw_response));
        }

        Ok(LlmPageExtract {
            records,
            raw_response,
        })
    }
}

// ========== 文本清洗 ==========

/// 清洗页面文本：去掉残留的脚本/样式块，压缩空白，按上限截断
///
/// 驱动读的是 innerText，大多数噪声已被浏览器滤掉；
/// 这里兜底处理 noscript 残留和超长空白。截断落在字符边界上。
pub fn clean_page_text(raw: &str, cap: usize) -> String {
    let mut text = raw.to_string();

    // 去掉偶尔混进 innerText 的内联脚本/样式残留
    for tag in ["script", "style", "noscript"] {
        let open = format!("<{}", tag);
        let close = format!("</{}>", tag);
        while let Some(start) = find_ascii_ci(&text, &open) {
            match find_ascii_ci(&text[start..], &close) {
                Some(rel_end) => {
                    let end = start + rel_end + close.len();
                    text.replace_range(start..end, " ");
                }
                None => {
                    text.truncate(start);
                    break;
                }
            }
        }
    }

    // 压缩空白：连续空白折叠成单个空格，保留换行的分段意义
    let mut collapsed = String::with_capacity(text.len());
    let mut last_was_space = false;
    let mut last_was_newline = false;
    for ch in text.chars() {
        if ch == '\n' {
            if !last_was_newline {
                collapsed.push('\n');
            }
            last_was_newline = true;
            last_was_space = false;
        } else if ch.is_whitespace() {
            if !last_was_space && !last_was_newline {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(ch);
            last_was_space = false;
            last_was_newline = false;
        }
    }
    let collapsed = collapsed.trim().to_string();

    // 按字符边界截断
    if collapsed.chars().count() > cap {
        collapsed.chars().take(cap).collect()
    } else {
        collapsed
    }
}

/// ASCII 大小写不敏感的子串定位
///
/// needle 必须是纯 ASCII；返回的偏移因此一定落在字符边界上。
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let ned = needle.as_bytes();
    if ned.is_empty() || hay.len() < ned.len() {
        return None;
    }
    (0..=hay.len() - ned.len()).find(|&i| hay[i..i + ned.len()].eq_ignore_ascii_case(ned))
}

// ========== 回复解析 ==========

/// 宽容解析后端回复
///
/// 依次尝试：
/// 1. 去掉 markdown 代码栅栏后直接解析
/// 2. 取第一个 `{` 到最后一个 `}` 的子串
/// 3. 取第一个 `[` 到最后一个 `]` 的子串
/// 接受 `{"permits": [...]}`、`{"records": [...]}` 或裸数组三种外形。
/// 全部失败返回空列表，不报错。
pub fn parse_backend_response(response: &str) -> Vec<ExtractedRecord> {
    let stripped = strip_code_fences(response);

    if let Some(records) = try_parse_json(&stripped) {
        return records;
    }

    // 回复里夹了说明文字：抠出最外层的对象或数组再试
    if let Some(sub) = substring_between(&stripped, '{', '}') {
        if let Some(records) = try_parse_json(sub) {
            return records;
        }
    }
    if let Some(sub) = substring_between(&stripped, '[', ']') {
        if let Some(records) = try_parse_json(sub) {
            return records;
        }
    }

    warn!("无法从后端回复中解析出记录: {}", truncate_for_log(response));
    Vec::new()
}

/// 去掉 ```json ... ``` 栅栏
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let without_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed.to_string(),
    };
    match without_open.rfind("```") {
        Some(idx) => without_open[..idx].trim().to_string(),
        None => without_open.trim().to_string(),
    }
}

fn substring_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn try_parse_json(text: &str) -> Option<Vec<ExtractedRecord>> {
    let value: JsonValue = serde_json::from_str(text).ok()?;

    let items = match &value {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(map) => {
            let inner = map.get("permits").or_else(|| map.get("records"))?;
            inner.as_array()?.clone()
        }
        _ => return None,
    };

    Some(items.iter().filter_map(ExtractedRecord::from_json).collect())
}

fn truncate_for_log(text: &str) -> String {
    crate::utils::truncate_text(text, 200)
}
