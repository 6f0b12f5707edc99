//! 会话流程测试：用脚本化驱动和后端跑完整的状态机，
//! 不碰真实浏览器和真实 LLM。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use permit_scrape::classifier::{classify, ClassifiedResult};
use permit_scrape::config::Config;
use permit_scrape::error::{AppError, AppResult, BackendError};
use permit_scrape::infrastructure::{PortalDriver, WaitCondition};
use permit_scrape::models::target::{RowPlan, Target};
use permit_scrape::services::backend::{ExtractionBackend, ExtractionRequest};
use permit_scrape::services::review_queue::{QueueStatus, ResolutionTag, ReviewQueue};
use permit_scrape::workflow::{SessionContext, SessionMachine, SessionOutcome};

const NEXT_SELECTOR: &str = "a.pager-next";

/// 一页脚本：页面文本 + 行计划能读到的行
struct PageScript {
    text: String,
    rows: Vec<BTreeMap<String, String>>,
}

/// 脚本化门户驱动
///
/// 点击翻页按钮推进到下一页；没有下一页时返回 false（按钮消失）。
struct ScriptedDriver {
    pages: Vec<PageScript>,
    current: Mutex<usize>,
    navigate_errors: Mutex<VecDeque<AppError>>,
    wait_results: Mutex<VecDeque<bool>>,
    next_clicks: Mutex<usize>,
}

impl ScriptedDriver {
    fn new(pages: Vec<PageScript>) -> Self {
        Self {
            pages,
            current: Mutex::new(0),
            navigate_errors: Mutex::new(VecDeque::new()),
            wait_results: Mutex::new(VecDeque::new()),
            next_clicks: Mutex::new(0),
        }
    }

    fn with_navigate_errors(self, errors: Vec<AppError>) -> Self {
        *self.navigate_errors.lock().unwrap() = errors.into();
        self
    }

    fn with_wait_results(self, results: Vec<bool>) -> Self {
        *self.wait_results.lock().unwrap() = results.into();
        self
    }

    fn next_click_count(&self) -> usize {
        *self.next_clicks.lock().unwrap()
    }

    fn current_page(&self) -> &PageScript {
        let idx = *self.current.lock().unwrap();
        &self.pages[idx]
    }
}

#[async_trait]
impl PortalDriver for ScriptedDriver {
    async fn navigate(&self, _url: &str, _timeout: Duration) -> AppResult<()> {
        match self.navigate_errors.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn current_url(&self) -> AppResult<String> {
        Ok("https://portal.test/results".to_string())
    }

    async fn wait_for(&self, _condition: &WaitCondition, _timeout: Duration) -> AppResult<bool> {
        Ok(self.wait_results.lock().unwrap().pop_front().unwrap_or(true))
    }

    async fn read_text(&self, _selector: Option<&str>) -> AppResult<String> {
        Ok(self.current_page().text.clone())
    }

    async fn click(&self, selector: &str) -> AppResult<bool> {
        if selector == NEXT_SELECTOR {
            *self.next_clicks.lock().unwrap() += 1;
            let mut current = self.current.lock().unwrap();
            if *current + 1 < self.pages.len() {
                *current += 1;
                return Ok(true);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn fill(&self, _selector: &str, _value: &str) -> AppResult<bool> {
        Ok(true)
    }

    async fn read_rows(&self, _plan: &RowPlan) -> AppResult<Vec<BTreeMap<String, String>>> {
        Ok(self.current_page().rows.clone())
    }

    async fn screenshot(&self) -> AppResult<Vec<u8>> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }
}

/// 脚本化提取后端：按顺序吐回复，脚本用完后永远返回空结果
struct ScriptedBackend {
    responses: Mutex<VecDeque<AppResult<String>>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<AppResult<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    fn silent() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    async fn extract(&self, _request: &ExtractionRequest) -> AppResult<String> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"permits": []}"#.to_string()))
    }

    fn describe(&self) -> String {
        "scripted-backend".to_string()
    }
}

// ========== 构造辅助 ==========

fn fast_config() -> Config {
    let mut config = Config::default();
    config.nav_timeout_ms = 200;
    config.wait_ceiling_ms = 60;
    config.poll_interval_ms = 5;
    config.max_snapshots = 3;
    config
}

fn structured_target(quota: Option<u32>) -> Target {
    let mut target: Target = toml::from_str(
        r##"
        id = "mesa-az"
        portal_name = "Mesa Permit Center"
        entry_url = "https://permits.mesa.test/search"
        policy = "structured"
        next_button = "a.pager-next"

        [search]
        submit_button = "#btnSearch"
        results_marker = "#resultsGrid"

        [rows]
        row_selector = "table#resultsGrid tr.data"

        [rows.columns]
        permit_id = "td.permit"
        address = "td.addr"
    "##,
    )
    .unwrap();
    target.quota = quota;
    target
}

fn natural_target(quota: Option<u32>) -> Target {
    let mut target: Target = toml::from_str(
        r##"
        id = "phoenix-az"
        portal_name = "Phoenix PDD Online"
        entry_url = "https://pddonline.phoenix.test"
        policy = "natural-language"
        next_button = "a.pager-next"

        [search]
        address_input = "#addr"
        submit_button = "#go"
        results_marker = ".results-list"
    "##,
    )
    .unwrap();
    target.quota = quota;
    target
}

fn auth_target() -> Target {
    toml::from_str(
        r##"
        id = "tucson-az"
        portal_name = "Tucson Development Services"
        entry_url = "https://permits.tucson.test"
        policy = "structured"
        requires_auth = true

        [auth]
        username = "inspector"
        password = "hunter2"
        username_input = "#user"
        password_input = "#pass"
        submit_button = "#login"
        success_selector = ".account-menu"

        [search]
        submit_button = "#btnSearch"
        results_marker = "#resultsGrid"

        [rows]
        row_selector = "tr.data"

        [rows.columns]
        permit_id = "td.permit"
        address = "td.addr"
    "##,
    )
    .unwrap()
}

fn permit_row(n: usize) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    row.insert("permit_id".to_string(), format!("B-2024-{}", 1100 + n));
    row.insert("address".to_string(), format!("{} E Campbell Ave", 4100 + n));
    row
}

fn results_page(page: usize, rows: Vec<BTreeMap<String, String>>) -> PageScript {
    PageScript {
        text: format!("Permit Search Results - Page {}", page),
        rows,
    }
}

fn machine(config: &Config, backend: ScriptedBackend) -> SessionMachine {
    SessionMachine::new(config, Arc::new(backend), 1)
}

fn assert_aligned(ctx: &SessionContext) {
    assert_eq!(
        ctx.actions.len(),
        ctx.step_errors.len(),
        "动作列表与错误槽必须等长"
    );
}

// ========== 流程测试 ==========

/// 配额在第 3 页达到就立即收手，哪怕还有下一页
#[tokio::test]
async fn test_quota_reached_stops_immediately() {
    let driver = ScriptedDriver::new(vec![
        results_page(1, (1..=4).map(permit_row).collect()),
        results_page(2, (5..=8).map(permit_row).collect()),
        results_page(3, (9..=12).map(permit_row).collect()),
    ]);
    let config = fast_config();
    let target = structured_target(Some(10));

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Success));
    // 第 3 页吸收完是 12 条，达到配额立即停，不再尝试第 4 页
    assert_eq!(ctx.records.len(), 12);
    assert_eq!(driver.next_click_count(), 2);
    assert_aligned(&ctx);

    let result = classify(&ctx, &target);
    match result {
        ClassifiedResult::TrustedSuccess { records } => assert_eq!(records.len(), 12),
        ClassifiedResult::NeedsReview { reason } => panic!("应为可信结果，实为: {}", reason),
    }
}

/// 导航两次都超时：失败记录在第一个动作槽上，分类为待审核
#[tokio::test]
async fn test_navigate_failure_recorded_at_first_action() {
    let driver = ScriptedDriver::new(vec![results_page(1, Vec::new())])
        .with_navigate_errors(vec![
            AppError::navigation_timeout("https://permits.mesa.test/search", 200),
            AppError::navigation_timeout("https://permits.mesa.test/search", 400),
        ]);
    let config = fast_config();
    let target = structured_target(None);

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Failed));
    assert_eq!(ctx.actions, vec!["navigate".to_string()]);
    assert_aligned(&ctx);

    let error = ctx.step_errors[0].as_deref().expect("错误应落在导航槽上");
    assert!(error.contains("首次"), "应合并记录两次尝试: {}", error);
    assert!(error.contains("重试"));

    assert!(!classify(&ctx, &target).is_trusted());
}

/// 占位记录被全数过滤：会话穷尽、零吸收、配额未达成进审核
#[tokio::test]
async fn test_placeholder_records_filtered_to_exhaustion() {
    let driver = ScriptedDriver::new(vec![
        results_page(1, Vec::new()),
        results_page(2, Vec::new()),
        results_page(3, Vec::new()),
    ]);
    let config = fast_config();
    let target = natural_target(Some(25));
    let backend = ScriptedBackend::new(vec![
        Ok(r#"{"permits": [{"permit_id": "PERMIT-2024-0001", "address": "123 Main St"}]}"#
            .to_string()),
        // 代码围栏也要能剥掉
        Ok("```json\n{\"permits\": [{\"permit_id\": \"SAMPLE-001\", \"address\": \"456 Elm St\"}]}\n```".to_string()),
    ]);

    let ctx = machine(&config, backend).run(&driver, &target).await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Exhausted));
    assert!(ctx.records.is_empty());
    assert_eq!(ctx.rejected_count, 2);
    assert!(!ctx.snapshots.is_empty(), "穷尽空手而归应留截图");
    assert_aligned(&ctx);

    match classify(&ctx, &target) {
        ClassifiedResult::NeedsReview { reason } => {
            assert!(reason.contains("配额 25"), "原因应点明配额未达成: {}", reason);
        }
        ClassifiedResult::TrustedSuccess { .. } => panic!("零记录且配额未达成不能算可信"),
    }
}

/// 失败会话入队后裁决一次：pending 清空，reviewed 留痕
#[tokio::test]
async fn test_failed_session_enqueue_and_resolve() {
    let driver = ScriptedDriver::new(vec![results_page(1, Vec::new())])
        .with_navigate_errors(vec![
            AppError::navigation_timeout("https://permits.mesa.test/search", 200),
            AppError::navigation_timeout("https://permits.mesa.test/search", 400),
        ]);
    let config = fast_config();
    let target = structured_target(None);

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    let reason = match classify(&ctx, &target) {
        ClassifiedResult::NeedsReview { reason } => reason,
        ClassifiedResult::TrustedSuccess { .. } => panic!("导航失败不能算可信"),
    };

    let dir = tempfile::tempdir().unwrap();
    let queue = ReviewQueue::new(dir.path());
    let entry = queue.enqueue(&ctx, &reason).await.unwrap();

    let resolved = queue
        .resolve(&entry.key, ResolutionTag::ManualFix, "换了选择器后手工补录")
        .await
        .unwrap();
    assert_eq!(resolved.status, QueueStatus::Reviewed);
    assert_eq!(resolved.resolution.as_ref().unwrap().tag, ResolutionTag::ManualFix);

    assert!(queue.list_pending(None).await.unwrap().is_empty());
    let reviewed = queue.list_reviewed(None).await.unwrap();
    assert_eq!(reviewed.len(), 1);
    assert_eq!(reviewed[0].context.target_id, "mesa-az");
}

/// 重复页不会让累计翻倍；动作序列按状态顺序排布
#[tokio::test]
async fn test_repeated_page_absorbed_once() {
    let rows: Vec<BTreeMap<String, String>> = (1..=2).map(permit_row).collect();
    let driver = ScriptedDriver::new(vec![
        results_page(1, rows.clone()),
        PageScript {
            text: "Permit Search Results - Page 2 (stale grid)".to_string(),
            rows,
        },
    ]);
    let config = fast_config();
    let target = structured_target(None);

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Success));
    assert_eq!(ctx.records.len(), 2);
    // 第二页按钮消失前机器已登记过尝试，动作序列里留有痕迹
    assert_eq!(
        ctx.actions,
        vec![
            "navigate",
            "configure",
            "submit",
            "extract_page_1",
            "next_page_2",
            "extract_page_2",
            "next_page_3",
        ]
    );
    assert_aligned(&ctx);
}

/// 拦截页标记直接判死整个会话
#[tokio::test]
async fn test_blocked_marker_fails_session() {
    let driver = ScriptedDriver::new(vec![PageScript {
        text: "Access Denied - your request looks like unusual traffic".to_string(),
        rows: Vec::new(),
    }]);
    let config = fast_config();
    let mut target = structured_target(None);
    target.blocked_markers = vec!["Access Denied".to_string()];

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Failed));
    assert!(!ctx.snapshots.is_empty(), "拦截页应留取证截图");
    assert!(ctx.has_step_errors());
    assert_aligned(&ctx);
    assert!(!classify(&ctx, &target).is_trusted());
}

/// 要求登录的门户：登录动作排在导航之后，成功后流程照常
#[tokio::test]
async fn test_auth_flow_success() {
    let driver = ScriptedDriver::new(vec![results_page(1, (1..=2).map(permit_row).collect())]);
    let config = fast_config();
    let target = auth_target();

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Success));
    assert_eq!(
        ctx.actions,
        vec!["navigate", "authenticate", "configure", "submit", "extract_page_1"]
    );
    assert_eq!(ctx.records.len(), 2);
    assert_aligned(&ctx);
}

/// 登录信号不出现：不重试，直接失败并留截图
#[tokio::test]
async fn test_auth_rejection_not_retried() {
    let driver = ScriptedDriver::new(vec![results_page(1, Vec::new())])
        .with_wait_results(vec![false]);
    let config = fast_config();
    let target = auth_target();

    let ctx = machine(&config, ScriptedBackend::silent())
        .run(&driver, &target)
        .await;

    assert_eq!(ctx.outcome, Some(SessionOutcome::Failed));
    assert_eq!(ctx.actions, vec!["navigate", "authenticate"]);
    assert!(ctx.step_errors[1].is_some(), "错误应落在登录槽上");
    assert!(!ctx.snapshots.is_empty());
    assert_aligned(&ctx);
}

/// 后端一次故障只废一页：会话继续、最终有货，但分类器仍打回审核
#[tokio::test]
async fn test_backend_hiccup_absorbed_but_demoted() {
    let driver = ScriptedDriver::new(vec![
        results_page(1, Vec::new()),
        results_page(2, Vec::new()),
    ]);
    let config = fast_config();
    let target = natural_target(None);
    let backend = ScriptedBackend::new(vec![
        Err(AppError::Backend(BackendError::EmptyResponse {
            model: "scripted".to_string(),
        })),
        Ok(r#"{"permits": [
            {"permit_id": "BLD2024-18733", "address": "4102 E Campbell Ave"},
            {"permit_id": "ENR-24-001122", "address": "77 W Thomas Rd"}
        ]}"#
        .to_string()),
    ]);

    let ctx = machine(&config, backend).run(&driver, &target).await;

    // 会话走到了成功终态
    assert_eq!(ctx.outcome, Some(SessionOutcome::Success));
    assert_eq!(ctx.records.len(), 2);
    // 但第一页的故障留了步骤错误
    assert!(ctx.has_step_errors());
    assert_aligned(&ctx);

    match classify(&ctx, &target) {
        ClassifiedResult::NeedsReview { reason } => {
            assert!(reason.contains("步骤错误"), "降级原因应点明步骤错误: {}", reason);
        }
        ClassifiedResult::TrustedSuccess { .. } => panic!("有步骤错误的会话不能算可信"),
    }
}
