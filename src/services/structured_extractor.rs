//! 结构化提取 - 业务能力层
//!
//! 确定性路径：按行计划直接查 DOM，要么拿到形状完整的记录，
//! 要么什么都拿不到。不猜测，不修补。

use tracing::debug;

use crate::error::AppResult;
use crate::infrastructure::portal_driver::PortalDriver;
use crate::models::record::ExtractedRecord;
use crate::models::target::RowPlan;

/// 一页结构化提取的产出
#[derive(Debug, Clone)]
pub struct StructuredPageExtract {
    pub records: Vec<ExtractedRecord>,
    /// 行选择器命中的原始行数（含被丢弃的空行）
    pub raw_row_count: usize,
}

/// 按行计划提取当前页
///
/// 命中零行和"行在但单元格全空"都返回空记录列表；
/// 二者的区分只体现在 raw_row_count 上，留给日志判断选择器是否失配。
pub async fn extract_page(
    driver: &dyn PortalDriver,
    plan: &RowPlan,
) -> AppResult<StructuredPageExtract> {
    let raw_rows = driver.read_rows(plan).await?;
    let raw_row_count = raw_rows.len();

    let records: Vec<ExtractedRecord> = raw_rows
        .into_iter()
        .map(ExtractedRecord::from_field_map)
        .filter(|record| !record.fields.is_empty())
        .collect();

    debug!(
        "结构化提取: 命中 {} 行，得到 {} 条记录",
        raw_row_count,
        records.len()
    );

    Ok(StructuredPageExtract {
        records,
        raw_row_count,
    })
}
