//! 可信度过滤 - 业务能力层
//!
//! 自然语言后端偶尔会"编"出教科书式的占位数据。这里按固定模式
//! 拦下这类记录：模板化许可编号、占位地址、过短标识。
//! 只丢弃并计数，从不尝试修正。

use phf::phf_set;
use regex::Regex;

use crate::models::record::ExtractedRecord;

/// 占位地址黑名单（小写归一后精确匹配）
static PLACEHOLDER_ADDRESSES: phf::Set<&'static str> = phf_set! {
    "123 main st",
    "123 main street",
    "1234 main st",
    "1234 main street",
    "456 main st",
    "1 main st",
    "100 main st",
    "123 elm st",
    "123 elm street",
    "456 elm st",
    "456 oak ave",
    "789 pine st",
    "123 example st",
    "123 example ave",
    "123 test st",
    "123 sample st",
    "123 fake st",
    "123 anywhere st",
    "123 any street",
    "123 your street",
};

/// 模板化许可编号：PERMIT/SAMPLE/TEST 一类的字面前缀
const PLACEHOLDER_ID_PREFIX: &str =
    r"(?i)^(permit|sample|example|test|demo|fake|placeholder|xxx+|abc)[-_ #]?\d";

/// 零填充低序列号结尾：-0001 / _00012 这一类
const ZERO_PADDED_LOW_SEQUENCE: &str = r"[-_]0{2,}\d{1,2}$";

/// 占位城市/街道用词
const PLACEHOLDER_ADDRESS_WORDS: &str =
    r"(?i)\b(anytown|anywhere|your (city|town)|example (city|town)|sample (city|town)|city name|n/a)\b";

/// 记录不可信的原因；None = 通过
pub fn rejection_reason(record: &ExtractedRecord) -> Option<&'static str> {
    if let Some(id) = record.permit_id() {
        let id = id.trim();
        if id.chars().count() < 4 {
            return Some("许可编号过短");
        }
        if let Ok(re) = Regex::new(PLACEHOLDER_ID_PREFIX) {
            if re.is_match(id) {
                return Some("模板化许可编号前缀");
            }
        }
        if let Ok(re) = Regex::new(ZERO_PADDED_LOW_SEQUENCE) {
            if re.is_match(id) {
                return Some("零填充低序列号");
            }
        }
    }

    if let Some(address) = record.address() {
        let normalized = normalize_address(address);
        if PLACEHOLDER_ADDRESSES.contains(normalized.as_str()) {
            return Some("占位地址");
        }
        if let Ok(re) = Regex::new(PLACEHOLDER_ADDRESS_WORDS) {
            if re.is_match(address) {
                return Some("占位地址用词");
            }
        }
    }

    None
}

pub fn is_plausible(record: &ExtractedRecord) -> bool {
    rejection_reason(record).is_none()
}

/// 过滤一页记录，返回 (通过的, 被丢弃数)
pub fn filter_records(records: Vec<ExtractedRecord>) -> (Vec<ExtractedRecord>, usize) {
    let total = records.len();
    let kept: Vec<ExtractedRecord> = records
        .into_iter()
        .filter(|record| match rejection_reason(record) {
            Some(reason) => {
                tracing::debug!(
                    "丢弃不可信记录 ({}): id={:?} address={:?}",
                    reason,
                    record.permit_id(),
                    record.address()
                );
                false
            }
            None => true,
        })
        .collect();
    let rejected = total - kept.len();
    (kept, rejected)
}

fn normalize_address(address: &str) -> String {
    address
        .trim()
        .trim_end_matches(['.', ','])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
