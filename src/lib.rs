//! # Permit Scrape
//!
//! 批量抓取市政许可门户的提取编排器
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page），只暴露能力
//! - `PortalDriver` - 浏览器自动化的窄契约，`ChromeDriver` 为生产实现
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心流程
//! - `ExtractionBackend` / `LlmExtractor` - 自然语言提取能力
//! - `structured_extractor` - 按行计划的确定性 DOM 提取能力
//! - `plausibility` - 占位记录过滤能力
//! - `ReviewQueue` - 审核队列能力（pending/ → reviewed/）
//! - `ResultSink` - JSONL 结果流落盘能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个门户会话"的完整流程
//! - `SessionContext` - 一次尝试的完整取证记录
//! - `SessionMachine` - 状态机编排（navigate → auth? → configure → submit → paginate ⟲）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_runner` - 批量目标调度器，管理资源和并发
//! - `orchestrator/target_processor` - 单个目标处理器，会话 → 分类 → 落盘
//! - `classifier` - 悲观结果分类器（trusted-success / needs-review）
//!
//! ## 模块结构

pub mod browser;
pub mod classifier;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use classifier::{classify, ClassifiedResult};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{ChromeDriver, PortalDriver};
pub use models::record::ExtractedRecord;
pub use models::target::{SearchCriteria, Target};
pub use orchestrator::{process_target, App, TargetReport};
pub use services::{ExtractionBackend, LlmExtractor, ResultSink, ReviewQueue};
pub use workflow::{SessionContext, SessionMachine, SessionOutcome};
