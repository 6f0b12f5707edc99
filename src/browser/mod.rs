//! 浏览器接入 - 基础设施层
//!
//! 两种接入方式：连接已运行实例（调试端口）或自行启动无头实例。
//! 由配置选择；拿到的 Browser 供编排器为每个工作器开独立页面。

pub mod connection;
pub mod headless;

use anyhow::Result;
use chromiumoxide::Browser;

use crate::config::Config;

/// 按配置接入浏览器
pub async fn attach(config: &Config) -> Result<Browser> {
    if config.use_headless {
        headless::launch_headless_browser(config.chrome_executable.as_deref()).await
    } else {
        connection::connect_to_browser(config.browser_debug_port).await
    }
}
