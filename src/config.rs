/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时运行的会话数量（并发上限 C）
    pub max_concurrent_sessions: usize,
    /// 浏览器调试端口（连接已运行的 Chrome 时使用）
    pub browser_debug_port: u16,
    /// 是否自行启动无头浏览器（false 则连接调试端口）
    pub use_headless: bool,
    /// Chrome 可执行文件路径（无头模式下可选）
    pub chrome_executable: Option<String>,
    /// 门户计划 TOML 存放目录
    pub targets_dir: String,
    /// 可信记录输出流（JSONL，每条记录一行）
    pub records_file: String,
    /// 增量运行日志（JSONL，每个目标完成后追加一行）
    pub run_log_file: String,
    /// 复核队列根目录（pending/ 与 reviewed/）
    pub review_queue_dir: String,
    /// 运行头日志文件
    pub output_log_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- 时间参数（毫秒） ---
    /// 首次导航超时
    pub nav_timeout_ms: u64,
    /// 各类条件等待的上限
    pub wait_ceiling_ms: u64,
    /// 条件轮询间隔
    pub poll_interval_ms: u64,
    // --- 提取参数 ---
    /// 送入提取后端的页面文本上限（字符数）
    pub page_text_cap: usize,
    /// 每个会话保留的截图上限
    pub max_snapshots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            browser_debug_port: 9222,
            use_headless: true,
            chrome_executable: None,
            targets_dir: "targets".to_string(),
            records_file: "permits.jsonl".to_string(),
            run_log_file: "run_log.jsonl".to_string(),
            review_queue_dir: "review_queue".to_string(),
            output_log_file: "output.txt".to_string(),
            verbose_logging: false,
            llm_api_key: "sk-placeholder".to_string(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            nav_timeout_ms: 30_000,
            wait_ceiling_ms: 15_000,
            poll_interval_ms: 250,
            page_text_cap: 20_000,
            max_snapshots: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_sessions: std::env::var("MAX_CONCURRENT_SESSIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_concurrent_sessions),
            browser_debug_port: std::env::var("BROWSER_DEBUG_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.browser_debug_port),
            use_headless: std::env::var("USE_HEADLESS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.use_headless),
            chrome_executable: std::env::var("CHROME_EXECUTABLE").ok().or(default.chrome_executable),
            targets_dir: std::env::var("TARGETS_DIR").unwrap_or(default.targets_dir),
            records_file: std::env::var("RECORDS_FILE").unwrap_or(default.records_file),
            run_log_file: std::env::var("RUN_LOG_FILE").unwrap_or(default.run_log_file),
            review_queue_dir: std::env::var("REVIEW_QUEUE_DIR").unwrap_or(default.review_queue_dir),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            nav_timeout_ms: std::env::var("NAV_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.nav_timeout_ms),
            wait_ceiling_ms: std::env::var("WAIT_CEILING_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.wait_ceiling_ms),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_interval_ms),
            page_text_cap: std::env::var("PAGE_TEXT_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(default.page_text_cap),
            max_snapshots: std::env::var("MAX_SNAPSHOTS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_snapshots),
        }
    }
}
