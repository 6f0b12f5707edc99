//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量调度和双路落盘，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_runner` - 批量目标调度器
//! - 管理应用生命周期（初始化、运行、统计）
//! - 批量加载目标（Vec<Target>）并盖上检索条件
//! - 滚动并发调度（Semaphore，许可先于 spawn）
//! - 管理浏览器资源（Browser，每工作器一个 Page）
//! - 输出全局统计信息
//!
//! ### `target_processor` - 单个目标处理器
//! - 驱动一个门户会话跑到终态（SessionMachine）
//! - 分类会话结果（classifier）
//! - 可信记录进结果流，存疑会话进审核队列
//! - 每个目标完成后追加一行运行日志
//! - 工作器异常的兜底入队
//!
//! ## 层次关系
//!
//! ```text
//! batch_runner (调度 Vec<Target>)
//!     ↓
//! target_processor (处理单个 Target)
//!     ↓
//! workflow::SessionMachine (跑单个会话)
//!     ↓
//! services (能力层：提取 / 过滤 / 队列 / 落盘)
//!     ↓
//! infrastructure (基础设施：PortalDriver)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_runner 管批量，target_processor 管单个
//! 2. **资源隔离**：只有编排层持有 Browser
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **异常不出边界**：会话失败进队列，只有存储错误中止批次

pub mod batch_runner;
pub mod target_processor;

// 重新导出主要类型
pub use batch_runner::App;
pub use target_processor::{process_target, report_worker_failure, TargetReport};
