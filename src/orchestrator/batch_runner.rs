//! 批量目标调度器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量门户目标的调度和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动日志、接入浏览器、建好队列目录
//! 2. **批量加载**：扫描目标文件夹并盖上本次运行的检索条件
//! 3. **并发控制**：Semaphore 限定同时在跑的会话数
//! 4. **滚动调度**：许可先于 spawn 获取，空出一个就放行下一个，不设批次栅栏
//! 5. **资源管理**：唯一持有 Browser，为每个工作器开独立页面
//! 6. **全局统计**：汇总所有目标的处理报告
//!
//! ## 设计特点
//!
//! - **异常不出边界**：工作器 panic 在收集侧转成审核队列条目
//! - **只有存储错误致命**：结果写不进盘才中止批次
//! - **向下委托**：单个目标的处理细节在 target_processor

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chromiumoxide::Browser;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::browser;
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::ChromeDriver;
use crate::models::target::{SearchCriteria, Target};
use crate::orchestrator::target_processor::{self, TargetReport};
use crate::services::backend::{ExtractionBackend, OpenAiBackend};
use crate::services::result_sink::ResultSink;
use crate::services::review_queue::ReviewQueue;

/// 应用主结构
pub struct App {
    config: Config,
    browser: Browser,
    backend: Arc<dyn ExtractionBackend>,
    queue: Arc<ReviewQueue>,
    sink: Arc<ResultSink>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        crate::utils::logging::init_log_file(&config.output_log_file)?;

        log_startup(&config);

        // 接入浏览器（连接调试端口或自行启动无头实例）
        let browser = browser::attach(&config).await?;

        let backend: Arc<dyn ExtractionBackend> = Arc::new(OpenAiBackend::new(&config));
        let queue = Arc::new(ReviewQueue::new(&config.review_queue_dir));
        let sink = Arc::new(ResultSink::new(&config.records_file, &config.run_log_file));

        // 队列目录先建好，批次中途再失败就只能是磁盘问题
        queue.ensure_layout().await?;

        Ok(Self {
            config,
            browser,
            backend,
            queue,
            sink,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self, criteria: Option<&SearchCriteria>) -> Result<()> {
        // 加载所有待抓取的目标
        let all_targets = self.load_targets(criteria).await?;

        if all_targets.is_empty() {
            warn!("⚠️ 没有找到可用的目标文件，程序结束");
            return Ok(());
        }

        let total_targets = all_targets.len();
        log_targets_loaded(total_targets, self.config.max_concurrent_sessions);

        // 处理所有目标
        let stats = self.process_all_targets(all_targets).await?;

        // 输出最终统计
        print_final_stats(&stats, &self.config);

        Ok(())
    }

    /// 加载目标
    async fn load_targets(&self, criteria: Option<&SearchCriteria>) -> Result<Vec<Target>> {
        info!("\n📁 正在扫描目标文件夹...");
        crate::models::load_all_targets(&self.config.targets_dir, criteria).await
    }

    /// 滚动调度所有目标
    ///
    /// 许可在 spawn 前获取，所以同时在跑的会话恒不超过上限；
    /// 页面也在 spawn 前创建，创建失败直接按工作器异常入队。
    async fn process_all_targets(&self, all_targets: Vec<Target>) -> Result<RunStats> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sessions));
        let mut stats = RunStats {
            total: all_targets.len(),
            ..Default::default()
        };

        let mut handles: Vec<(usize, Target, JoinHandle<AppResult<TargetReport>>)> = Vec::new();

        for (idx, target) in all_targets.into_iter().enumerate() {
            let target_index = idx + 1;
            let permit = semaphore.clone().acquire_owned().await?;

            let page = match self.browser.new_page("about:blank").await {
                Ok(page) => page,
                Err(e) => {
                    drop(permit);
                    let report = target_processor::report_worker_failure(
                        &target,
                        target_index,
                        &format!("创建页面失败: {}", e),
                        &self.queue,
                        &self.sink,
                    )
                    .await?;
                    stats.tally(&report);
                    continue;
                }
            };
            let driver =
                ChromeDriver::new(page, Duration::from_millis(self.config.poll_interval_ms));

            let target_clone = target.clone();
            let config_clone = self.config.clone();
            let backend = self.backend.clone();
            let queue = self.queue.clone();
            let sink = self.sink.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = target_processor::process_target(
                    &driver,
                    &target_clone,
                    target_index,
                    &config_clone,
                    backend,
                    &queue,
                    &sink,
                )
                .await;

                // 页面用完即关，失败只告警
                if let Err(e) = driver.page().clone().close().await {
                    warn!("[目标 {}] ⚠️ 页面关闭失败: {}", target_index, e);
                }
                result
            });
            handles.push((target_index, target, handle));
        }

        // 收集全部工作器结果
        for (target_index, target, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => {
                    stats.tally(&report);
                }
                // 存储层失败：结果已经落不了盘，继续跑只会丢数据
                Ok(Err(storage_err)) => {
                    return Err(storage_err.into());
                }
                // 工作器 panic：按异常兜底入队，批次继续
                Err(join_err) => {
                    let report = target_processor::report_worker_failure(
                        &target,
                        target_index,
                        &join_err.to_string(),
                        &self.queue,
                        &self.sink,
                    )
                    .await?;
                    stats.tally(&report);
                }
            }
        }

        Ok(stats)
    }
}

/// 批次统计
#[derive(Debug, Default)]
struct RunStats {
    total: usize,
    trusted: usize,
    needs_review: usize,
    records_written: usize,
    rejected_total: usize,
}

impl RunStats {
    fn tally(&mut self, report: &TargetReport) {
        if report.is_trusted() {
            self.trusted += 1;
        } else {
            self.needs_review += 1;
        }
        self.records_written += report.accepted;
        self.rejected_total += report.rejected as usize;
    }
}

// ========== 日志辅助函数 ==========

fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 多门户许可提取模式");
    info!("📊 最大并发会话数: {}", config.max_concurrent_sessions);
    if config.use_headless {
        info!("🌐 浏览器接入: 无头启动");
    } else {
        info!("🌐 浏览器接入: 调试端口 {}", config.browser_debug_port);
    }
    info!("{}", "=".repeat(60));
}

fn log_targets_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待抓取的门户目标", total);
    info!("📋 并发上限 {} 个，空出一个即放行下一个\n", max_concurrent);
}

fn print_final_stats(stats: &RunStats, config: &Config) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部目标处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 可信成功: {}/{}", stats.trusted, stats.total);
    info!("📥 待人工审核: {}", stats.needs_review);
    info!(
        "📦 落盘记录: {} 条 (可信度过滤丢弃 {} 条)",
        stats.records_written, stats.rejected_total
    );
    info!("{}", "=".repeat(60));
    info!("\n结果流: {}", config.records_file);
    info!("运行日志: {}", config.run_log_file);
    info!("审核队列: {}/pending", config.review_queue_dir);
}
