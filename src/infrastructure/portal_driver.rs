//! 门户驱动 - 基础设施层
//!
//! 持有唯一的 page 资源，把会话状态机需要的全部低层操作
//! （导航、条件等待、点击、填表、读行、截图）收拢成一个窄接口。
//!
//! ## 职责
//! - 不认识 Target / SessionContext
//! - 不处理业务流程
//! - 所有操作都有超时上限，没有任何操作保证幂等

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{AppError, AppResult};
use crate::models::target::RowPlan;

/// 条件等待的目标状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// 选择器命中至少一个元素
    SelectorPresent(String),
    /// 选择器不再命中任何元素（加载指示器消失）
    SelectorAbsent(String),
    /// 当前 URL 包含片段
    UrlContains(String),
}

/// 浏览器自动化能力的窄契约
///
/// 会话状态机只通过这组方法触碰页面，方便测试时整体替换。
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// 导航到 URL，超时由调用方给定
    async fn navigate(&self, url: &str, timeout: Duration) -> AppResult<()>;

    /// 当前页面 URL
    async fn current_url(&self) -> AppResult<String>;

    /// 轮询等待条件成立；到达上限返回 Ok(false)，不算错误
    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> AppResult<bool>;

    /// 读取可见文本；selector 为空时读整个 body
    async fn read_text(&self, selector: Option<&str>) -> AppResult<String>;

    /// 点击元素；false = 元素不存在
    async fn click(&self, selector: &str) -> AppResult<bool>;

    /// 填入文本并触发 input/change 事件；false = 元素不存在
    async fn fill(&self, selector: &str, value: &str) -> AppResult<bool>;

    /// 按行计划读取结果表格，返回字段名到单元格文本的映射列表
    async fn read_rows(&self, plan: &RowPlan) -> AppResult<Vec<BTreeMap<String, String>>>;

    /// 截取当前视口 PNG
    async fn screenshot(&self) -> AppResult<Vec<u8>>;
}

/// 生产实现：一个工作器独占一个 Chrome 页面
///
/// 页面交互全部走 `Page::evaluate` 的 JS 片段，与拿元素句柄相比
/// 对老旧政务门户的 iframe 嵌套和自绘控件更宽容。
pub struct ChromeDriver {
    page: Page,
    poll_interval: Duration,
}

impl ChromeDriver {
    pub fn new(page: Page, poll_interval: Duration) -> Self {
        Self { page, poll_interval }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 执行 JS 代码并返回 JSON 结果
    async fn eval(&self, action: &'static str, js_code: String) -> AppResult<JsonValue> {
        let result = self
            .page
            .evaluate(js_code)
            .await
            .map_err(|e| AppError::driver_call_failed(action, e))?;
        let json_value = result
            .into_value()
            .map_err(|e| AppError::driver_call_failed(action, e))?;
        Ok(json_value)
    }

    async fn eval_bool(&self, action: &'static str, js_code: String) -> AppResult<bool> {
        Ok(self.eval(action, js_code).await?.as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl PortalDriver for ChromeDriver {
    async fn navigate(&self, url: &str, nav_timeout: Duration) -> AppResult<()> {
        match timeout(nav_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(AppError::navigation_failed(url, e)),
            Err(_) => Err(AppError::navigation_timeout(url, nav_timeout.as_millis() as u64)),
        }
    }

    async fn current_url(&self) -> AppResult<String> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| AppError::driver_call_failed("current_url", e))?;
        Ok(url.unwrap_or_default())
    }

    async fn wait_for(&self, condition: &WaitCondition, ceiling: Duration) -> AppResult<bool> {
        let deadline = Instant::now() + ceiling;
        loop {
            let satisfied = match condition {
                WaitCondition::SelectorPresent(sel) => {
                    self.eval_bool("wait_for", js_selector_check(sel, true)).await?
                }
                WaitCondition::SelectorAbsent(sel) => {
                    self.eval_bool("wait_for", js_selector_check(sel, false)).await?
                }
                WaitCondition::UrlContains(fragment) => {
                    self.current_url().await?.contains(fragment.as_str())
                }
            };
            if satisfied {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn read_text(&self, selector: Option<&str>) -> AppResult<String> {
        let js = match selector {
            Some(sel) => format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    return el ? el.innerText : '';
                }})()"#,
                sel = js_string(sel)
            ),
            None => "(() => document.body ? document.body.innerText : '')()".to_string(),
        };
        let value = self.eval("read_text", js).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn click(&self, selector: &str) -> AppResult<bool> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            sel = js_string(selector)
        );
        self.eval_bool("click", js).await
    }

    async fn fill(&self, selector: &str, value: &str) -> AppResult<bool> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_string(selector),
            val = js_string(value)
        );
        self.eval_bool("fill", js).await
    }

    async fn read_rows(&self, plan: &RowPlan) -> AppResult<Vec<BTreeMap<String, String>>> {
        let js = js_read_rows(plan);
        let value = self.eval("read_rows", js).await?;
        let rows = serde_json::from_value(value)
            .map_err(|e| AppError::driver_call_failed("read_rows", e))?;
        Ok(rows)
    }

    async fn screenshot(&self) -> AppResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| AppError::driver_call_failed("screenshot", e))
    }
}

// ========== JS 片段构造 ==========

/// 把 Rust 字符串安全地嵌入为 JS 字符串字面量
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn js_selector_check(selector: &str, present: bool) -> String {
    let cmp = if present { "!==" } else { "===" };
    format!(
        "(() => document.querySelector({sel}) {cmp} null)()",
        sel = js_string(selector),
        cmp = cmp
    )
}

/// 按行计划生成读表 JS：对每个行元素取各列单元格的文本
fn js_read_rows(plan: &RowPlan) -> String {
    let columns_js: Vec<String> = plan
        .columns
        .iter()
        .map(|(field, cell_sel)| {
            format!(
                r#"      {{ field: {field}, sel: {sel} }}"#,
                field = js_string(field),
                sel = js_string(cell_sel)
            )
        })
        .collect();

    format!(
        r#"(() => {{
    const columns = [
{columns}
    ];
    const rows = Array.from(document.querySelectorAll({row_sel}));
    return rows.map(row => {{
        const record = {{}};
        for (const col of columns) {{
            const cell = row.querySelector(col.sel);
            if (cell) {{
                const text = cell.innerText.trim();
                if (text) record[col.field] = text;
            }}
        }}
        return record;
    }});
}})()"#,
        columns = columns_js.join(",\n"),
        row_sel = js_string(&plan.row_selector)
    )
}
