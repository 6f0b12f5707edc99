use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 常用字段名（下游消费方只依赖 permit_id 和 address）
pub const FIELD_PERMIT_ID: &str = "permit_id";
pub const FIELD_ADDRESS: &str = "address";
pub const FIELD_CATEGORY: &str = "category";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_DATE: &str = "date";
pub const FIELD_DESCRIPTION: &str = "description";

/// 统一的提取记录
///
/// 字段名到值的开放映射。同一会话内的记录不要求携带同一组可选字段；
/// 核心不强制 permit_id / address 必须存在，交给分类器判断质量。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub fields: BTreeMap<String, String>,
}

impl ExtractedRecord {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }

    /// 从字符串映射构建（结构化提取路径）
    pub fn from_field_map(raw: BTreeMap<String, String>) -> Self {
        let fields = raw
            .into_iter()
            .map(|(k, v)| (k, v.trim().to_string()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        Self { fields }
    }

    /// 从 JSON 对象构建（自然语言提取路径）
    ///
    /// 只接收对象，标量值统一转成字符串；嵌套结构会被丢弃。
    /// 非对象输入返回 None。
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let mut fields = BTreeMap::new();
        for (key, val) in obj {
            let text = match val {
                JsonValue::String(s) => s.trim().to_string(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => continue,
            };
            if !text.is_empty() {
                fields.insert(key.clone(), text);
            }
        }
        if fields.is_empty() {
            None
        } else {
            Some(Self { fields })
        }
    }

    pub fn permit_id(&self) -> Option<&str> {
        self.fields.get(FIELD_PERMIT_ID).map(String::as_str)
    }

    pub fn address(&self) -> Option<&str> {
        self.fields.get(FIELD_ADDRESS).map(String::as_str)
    }

    /// 去重键：优先 permit_id，缺失时退回 address
    ///
    /// 两者都缺失的记录无法去重，返回 None（调用方按"每次都算新记录"处理）。
    pub fn dedup_key(&self) -> Option<String> {
        self.permit_id()
            .or_else(|| self.address())
            .map(|s| s.trim().to_lowercase())
    }
}
