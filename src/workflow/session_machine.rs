//! 会话状态机 - 流程层
//!
//! 核心职责：定义"一个门户"的完整抓取流程
//!
//! 状态顺序：
//! 1. navigate → (authenticate) → configure → submit
//! 2. paginate ⟲（提取 → 过滤 → 吸收 → 终止判定 → 翻页）
//! 3. 终态三选一：success | exhausted | failed
//!
//! 所有会话级错误都落在 SessionContext 里，run() 永不向外抛错；
//! 能不能信这份结果是分类器的事，这里只负责把过程走完、记全。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::infrastructure::portal_driver::{PortalDriver, WaitCondition};
use crate::models::target::{AuthPlan, ExtractionPolicy, SearchCriteria, Target};
use crate::services::backend::ExtractionBackend;
use crate::services::llm_extractor::LlmExtractor;
use crate::services::{plausibility, structured_extractor};
use crate::workflow::session_context::{SessionContext, SessionOutcome};

/// 连续零新增页数达到该值视为自然穷尽
const EXHAUSTION_STREAK: u32 = 3;

/// 单会话翻页上限，防内容指纹误判时打转
const MAX_PAGES: u32 = 100;

/// 会话状态机
///
/// - 编排一个门户从导航到终态的完整流程
/// - 不持有 page 资源，驱动由调用方注入
/// - 提取、过滤、落盘能力全部来自 services
pub struct SessionMachine {
    extractor: LlmExtractor,
    nav_timeout: Duration,
    wait_ceiling: Duration,
    poll_interval: Duration,
    max_snapshots: usize,
    verbose_logging: bool,
    /// 批次内序号，仅用于日志前缀
    target_index: usize,
}

impl SessionMachine {
    pub fn new(config: &Config, backend: Arc<dyn ExtractionBackend>, target_index: usize) -> Self {
        Self {
            extractor: LlmExtractor::new(backend, config.page_text_cap),
            nav_timeout: Duration::from_millis(config.nav_timeout_ms),
            wait_ceiling: Duration::from_millis(config.wait_ceiling_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_snapshots: config.max_snapshots,
            verbose_logging: config.verbose_logging,
            target_index,
        }
    }

    /// 跑完一个门户会话，返回冻结的上下文
    pub async fn run(&self, driver: &dyn PortalDriver, target: &Target) -> SessionContext {
        let mut ctx = SessionContext::new(&target.id, target.task_description());

        info!(
            "[目标 {}] 🚀 开始会话: {} ({})",
            self.target_index, target.portal_name, target.entry_url
        );
        debug!(
            "[目标 {}] 提取策略: {:?}, 后端: {}",
            self.target_index,
            target.policy,
            self.extractor.backend_name()
        );

        // ========== 状态 1: navigate ==========
        if !self.navigate_step(driver, target, &mut ctx).await {
            return ctx;
        }

        // ========== 状态 2: authenticate（可选） ==========
        if let Some(plan) = target.auth_plan() {
            if !self.auth_step(driver, plan, &mut ctx).await {
                return ctx;
            }
        }

        // ========== 状态 3: configure ==========
        if !self.configure_step(driver, target, &mut ctx).await {
            return ctx;
        }

        // ========== 状态 4: submit ==========
        if !self.submit_step(driver, target, &mut ctx).await {
            return ctx;
        }

        // ========== 状态 5: paginate ⟲ ==========
        self.paginate_loop(driver, target, &mut ctx).await;

        self.log_session_end(&ctx);
        ctx
    }

    /// 导航：失败或超时重试一次，重试超时放宽到 2 倍
    ///
    /// 两次尝试共用 "navigate" 这一个动作槽，重试仍失败时
    /// 两次错误合并记录在该槽位上。
    async fn navigate_step(
        &self,
        driver: &dyn PortalDriver,
        target: &Target,
        ctx: &mut SessionContext,
    ) -> bool {
        ctx.record_action("navigate");

        let first_err = match driver.navigate(&target.entry_url, self.nav_timeout).await {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        if let Some(first) = first_err {
            warn!(
                "[目标 {}] ⚠️ 导航失败，放宽超时重试一次: {}",
                self.target_index, first
            );
            if let Err(second) = driver
                .navigate(&target.entry_url, self.nav_timeout * 2)
                .await
            {
                error!("[目标 {}] ❌ 导航重试仍失败: {}", self.target_index, second);
                ctx.record_step_error(format!("首次: {}; 重试: {}", first, second));
                ctx.finish(SessionOutcome::Failed);
                return false;
            }
            info!("[目标 {}] ✓ 导航重试成功", self.target_index);
        }

        match driver.current_url().await {
            Ok(url) => ctx.record_url(url),
            Err(e) => debug!("[目标 {}] 读取当前 URL 失败: {}", self.target_index, e),
        }
        info!("[目标 {}] ✓ 已到达入口页", self.target_index);
        true
    }

    /// 登录：填凭据 → 点提交 → 等成功信号；绝不重试
    async fn auth_step(
        &self,
        driver: &dyn PortalDriver,
        plan: &AuthPlan,
        ctx: &mut SessionContext,
    ) -> bool {
        ctx.record_action("authenticate");
        info!("[目标 {}] 🔑 门户要求登录", self.target_index);

        let filled = match self.fill_credentials(driver, plan).await {
            Ok(f) => f,
            Err(e) => {
                return self.fail_auth(driver, ctx, format!("登录操作失败: {}", e)).await;
            }
        };
        if !filled {
            return self.fail_auth(driver, ctx, "登录控件缺失".to_string()).await;
        }

        let clicked = match driver.click(&plan.submit_button).await {
            Ok(c) => c,
            Err(e) => {
                return self.fail_auth(driver, ctx, format!("登录提交失败: {}", e)).await;
            }
        };
        if !clicked {
            return self.fail_auth(driver, ctx, "登录提交按钮缺失".to_string()).await;
        }

        // 成功信号：优先 DOM 元素，其次 URL 片段，都没有就只能等一拍
        let verified = if let Some(sel) = &plan.success_selector {
            self.wait_quiet(driver, &WaitCondition::SelectorPresent(sel.clone()))
                .await
        } else if let Some(fragment) = &plan.success_url_fragment {
            self.wait_quiet(driver, &WaitCondition::UrlContains(fragment.clone()))
                .await
        } else {
            tokio::time::sleep(self.poll_interval * 4).await;
            true
        };

        if !verified {
            return self.fail_auth(driver, ctx, "登录成功信号未出现".to_string()).await;
        }

        if let Ok(url) = driver.current_url().await {
            ctx.record_url(url);
        }
        info!("[目标 {}] ✓ 登录完成", self.target_index);
        true
    }

    /// 配置检索条件：尽力而为，控件缺失只告警、不算步骤错误
    async fn configure_step(
        &self,
        driver: &dyn PortalDriver,
        target: &Target,
        ctx: &mut SessionContext,
    ) -> bool {
        ctx.record_action("configure");

        let criteria = match &target.criteria {
            Some(c) => c,
            None => {
                debug!("[目标 {}] 无检索条件，跳过配置", self.target_index);
                return true;
            }
        };
        info!("[目标 {}] 🔍 配置{}", self.target_index, criteria.describe());

        let result = match criteria {
            SearchCriteria::Address { query } => {
                self.fill_optional(driver, target.search.address_input.as_deref(), query, "地址输入框")
                    .await
            }
            SearchCriteria::DateRange { start, end } => {
                let from = start.format("%m/%d/%Y").to_string();
                let to = end.format("%m/%d/%Y").to_string();
                match self
                    .fill_optional(driver, target.search.date_from_input.as_deref(), &from, "起始日期框")
                    .await
                {
                    Ok(()) => {
                        self.fill_optional(driver, target.search.date_to_input.as_deref(), &to, "结束日期框")
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            // 驱动本身坏了（页面崩溃一类）才会走到这，控件缺失不会
            error!("[目标 {}] ❌ 配置步骤驱动错误: {}", self.target_index, e);
            ctx.record_step_error(format!("配置失败: {}", e));
            ctx.finish(SessionOutcome::Failed);
            return false;
        }
        true
    }

    /// 提交检索并等待内容就位信号
    async fn submit_step(
        &self,
        driver: &dyn PortalDriver,
        target: &Target,
        ctx: &mut SessionContext,
    ) -> bool {
        ctx.record_action("submit");

        let before_fp = match driver.read_text(None).await {
            Ok(text) => Some(fingerprint(&text)),
            Err(_) => None,
        };

        match driver.click(&target.search.submit_button).await {
            Ok(true) => debug!("[目标 {}] 已点击检索按钮", self.target_index),
            Ok(false) => {
                // 有些门户入口即结果页，没有独立的检索按钮
                warn!(
                    "[目标 {}] ⚠️ 检索按钮 {} 未找到，按已提交处理",
                    self.target_index, target.search.submit_button
                );
            }
            Err(e) => {
                error!("[目标 {}] ❌ 点击检索按钮失败: {}", self.target_index, e);
                ctx.record_step_error(format!("提交失败: {}", e));
                ctx.finish(SessionOutcome::Failed);
                return false;
            }
        }

        // 信号优先级：结果区域出现 > 加载指示消失 > 页面文本指纹变化
        let arrived = if let Some(marker) = &target.search.results_marker {
            self.wait_quiet(driver, &WaitCondition::SelectorPresent(marker.clone()))
                .await
        } else if let Some(loading) = &target.search.loading_marker {
            self.wait_quiet(driver, &WaitCondition::SelectorAbsent(loading.clone()))
                .await
        } else if let Some(fp) = before_fp {
            self.wait_text_change(driver, fp).await
        } else {
            tokio::time::sleep(self.poll_interval * 4).await;
            true
        };

        if !arrived {
            error!(
                "[目标 {}] ❌ 检索提交后 {}ms 内无内容变化信号",
                self.target_index,
                self.wait_ceiling.as_millis()
            );
            ctx.record_step_error(format!(
                "提交超时: {}ms 内结果未就位",
                self.wait_ceiling.as_millis()
            ));
            self.try_snapshot(driver, ctx).await;
            ctx.finish(SessionOutcome::Failed);
            return false;
        }

        info!("[目标 {}] ✓ 检索已提交，结果就位", self.target_index);
        true
    }

    /// 翻页主循环：提取 → 过滤 → 吸收 → 终止判定 → 翻页
    async fn paginate_loop(
        &self,
        driver: &dyn PortalDriver,
        target: &Target,
        ctx: &mut SessionContext,
    ) {
        let mut consecutive_zero: u32 = 0;
        let mut page_num: u32 = 1;
        let mut prior_context: Option<String> = None;

        loop {
            ctx.record_action(format!("extract_page_{}", page_num));

            let page_text = match driver.read_text(None).await {
                Ok(text) => text,
                Err(e) => {
                    error!("[目标 {}] ❌ 读取页面失败: {}", self.target_index, e);
                    ctx.record_step_error(format!("读取页面失败: {}", e));
                    ctx.finish(SessionOutcome::Failed);
                    return;
                }
            };

            // 拦截页识别：属于未恢复错误，整个会话作废
            if let Some(marker) = detect_block(&page_text, &target.blocked_markers) {
                error!("[目标 {}] ❌ 命中拦截页标记: {}", self.target_index, marker);
                ctx.record_step_error(format!("门户拦截页: {}", marker));
                self.try_snapshot(driver, ctx).await;
                ctx.finish(SessionOutcome::Failed);
                return;
            }

            let new_count = match target.policy {
                ExtractionPolicy::Structured => {
                    match self.extract_structured(driver, target, ctx).await {
                        Some(count) => count,
                        None => return, // 驱动层故障，ctx 已收束
                    }
                }
                ExtractionPolicy::NaturalLanguage => {
                    self.extract_natural(target, ctx, &page_text, prior_context.clone())
                        .await
                }
            };

            self.log_page(page_num, new_count, ctx.records.len());

            // 详细日志（如果启用）
            if self.verbose_logging {
                self.log_new_records(ctx, new_count);
            }

            // 终止判定 1: 配额达成即停，不再尝试下一页
            if target.has_positive_quota() {
                if let Some(quota) = target.quota {
                    if ctx.records.len() >= quota as usize {
                        info!(
                            "[目标 {}] ✅ 配额达成 ({}/{})，会话成功",
                            self.target_index,
                            ctx.records.len(),
                            quota
                        );
                        ctx.finish(SessionOutcome::Success);
                        return;
                    }
                }
            }

            // 终止判定 2: 连续零新增
            if new_count == 0 {
                consecutive_zero += 1;
                if consecutive_zero >= EXHAUSTION_STREAK {
                    debug!(
                        "[目标 {}] 连续 {} 页无新增，自然穷尽",
                        self.target_index, consecutive_zero
                    );
                    break;
                }
            } else {
                consecutive_zero = 0;
            }

            if page_num >= MAX_PAGES {
                warn!("[目标 {}] ⚠️ 达到翻页上限 {}，按穷尽处理", self.target_index, MAX_PAGES);
                break;
            }

            // 翻页；没有翻页按钮的门户一页即全部
            let next_sel = match &target.next_button {
                Some(sel) => sel,
                None => break,
            };

            ctx.record_action(format!("next_page_{}", page_num + 1));
            let before_fp = fingerprint(&page_text);
            match driver.click(next_sel).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("[目标 {}] 翻页按钮消失，自然穷尽", self.target_index);
                    break;
                }
                Err(e) => {
                    error!("[目标 {}] ❌ 翻页点击失败: {}", self.target_index, e);
                    ctx.record_step_error(format!("翻页失败: {}", e));
                    ctx.finish(SessionOutcome::Failed);
                    return;
                }
            }

            if !self.wait_text_change(driver, before_fp).await {
                debug!("[目标 {}] 翻页后内容无变化，自然穷尽", self.target_index);
                break;
            }

            page_num += 1;
            prior_context = Some(format!(
                "{} records were already extracted from earlier pages; continue with new ones only.",
                ctx.records.len()
            ));
        }

        // 自然穷尽：有货算成功，空手而归是 exhausted
        if ctx.records.is_empty() {
            self.try_snapshot(driver, ctx).await;
            ctx.finish(SessionOutcome::Exhausted);
        } else {
            ctx.finish(SessionOutcome::Success);
        }
    }

    /// 结构化提取一页；None 表示会话已收束为 failed
    async fn extract_structured(
        &self,
        driver: &dyn PortalDriver,
        target: &Target,
        ctx: &mut SessionContext,
    ) -> Option<usize> {
        let plan = match &target.rows {
            Some(plan) => plan,
            None => {
                // 加载器挡住了这种配置，这里兜底
                ctx.record_step_error("结构化策略缺少行计划".to_string());
                ctx.finish(SessionOutcome::Failed);
                return None;
            }
        };

        match structured_extractor::extract_page(driver, plan).await {
            Ok(extract) => {
                if let Ok(payload) = serde_json::to_string(&extract.records) {
                    ctx.raw_final_output = Some(payload);
                }
                if extract.raw_row_count > 0 && extract.records.is_empty() {
                    warn!(
                        "[目标 {}] ⚠️ 行选择器命中 {} 行但全为空，疑似列计划失配",
                        self.target_index, extract.raw_row_count
                    );
                }
                Some(ctx.absorb_records(extract.records))
            }
            Err(e) => {
                error!("[目标 {}] ❌ 结构化提取失败: {}", self.target_index, e);
                ctx.record_step_error(format!("结构化提取失败: {}", e));
                ctx.finish(SessionOutcome::Failed);
                None
            }
        }
    }

    /// 自然语言提取一页：后端故障按零记录吸收，会话继续
    async fn extract_natural(
        &self,
        target: &Target,
        ctx: &mut SessionContext,
        page_text: &str,
        prior_context: Option<String>,
    ) -> usize {
        let task = target.task_description();
        match self
            .extractor
            .extract_page(&task, page_text, prior_context)
            .await
        {
            Ok(extract) => {
                ctx.raw_final_output = Some(extract.raw_response);
                let (kept, rejected) = plausibility::filter_records(extract.records);
                if rejected > 0 {
                    warn!(
                        "[目标 {}] ⚠️ 可信度过滤丢弃 {} 条占位记录",
                        self.target_index, rejected
                    );
                    ctx.rejected_count += rejected as u32;
                }
                ctx.absorb_records(kept)
            }
            Err(e) => {
                warn!(
                    "[目标 {}] ⚠️ 提取后端故障，本页按零记录处理: {}",
                    self.target_index, e
                );
                ctx.record_step_error(format!("提取后端故障: {}", e));
                0
            }
        }
    }

    // ========== 小步骤辅助 ==========

    async fn fill_credentials(
        &self,
        driver: &dyn PortalDriver,
        plan: &AuthPlan,
    ) -> crate::error::AppResult<bool> {
        let user_ok = driver.fill(&plan.username_input, &plan.username).await?;
        let pass_ok = driver.fill(&plan.password_input, &plan.password).await?;
        Ok(user_ok && pass_ok)
    }

    /// 登录失败统一收束：截图 + 记错 + failed
    async fn fail_auth(
        &self,
        driver: &dyn PortalDriver,
        ctx: &mut SessionContext,
        reason: String,
    ) -> bool {
        error!("[目标 {}] ❌ 登录被拒: {}", self.target_index, reason);
        ctx.record_step_error(format!("登录被拒: {}", reason));
        self.try_snapshot(driver, ctx).await;
        ctx.finish(SessionOutcome::Failed);
        false
    }

    /// 填一个可选控件；计划里没配或页面上没有都只告警
    async fn fill_optional(
        &self,
        driver: &dyn PortalDriver,
        selector: Option<&str>,
        value: &str,
        label: &str,
    ) -> crate::error::AppResult<()> {
        match selector {
            Some(sel) => {
                if !driver.fill(sel, value).await? {
                    warn!(
                        "[目标 {}] ⚠️ {}({}) 在页面上未找到，跳过",
                        self.target_index, label, sel
                    );
                }
            }
            None => {
                warn!("[目标 {}] ⚠️ 计划未配置{}，跳过", self.target_index, label);
            }
        }
        Ok(())
    }

    /// 条件等待；驱动错误降级为 false，由调用方按超时路径处理
    async fn wait_quiet(&self, driver: &dyn PortalDriver, condition: &WaitCondition) -> bool {
        match driver.wait_for(condition, self.wait_ceiling).await {
            Ok(satisfied) => satisfied,
            Err(e) => {
                warn!("[目标 {}] ⚠️ 条件等待驱动错误: {}", self.target_index, e);
                false
            }
        }
    }

    /// 轮询页面文本指纹直到变化；上限内未变返回 false
    async fn wait_text_change(&self, driver: &dyn PortalDriver, before: u64) -> bool {
        let deadline = tokio::time::Instant::now() + self.wait_ceiling;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Ok(text) = driver.read_text(None).await {
                if fingerprint(&text) != before {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// 留取证截图；截图失败不影响会话
    async fn try_snapshot(&self, driver: &dyn PortalDriver, ctx: &mut SessionContext) {
        match driver.screenshot().await {
            Ok(png) => {
                debug!("[目标 {}] 📸 已留存截图 ({} 字节)", self.target_index, png.len());
                ctx.push_snapshot(png, self.max_snapshots);
            }
            Err(e) => warn!("[目标 {}] ⚠️ 截图失败: {}", self.target_index, e),
        }
    }

    // ========== 日志辅助函数 ==========

    fn log_page(&self, page_num: u32, new_count: usize, total: usize) {
        info!(
            "[目标 {}] 📦 第 {} 页: 新增 {} 条 (累计 {} 条)",
            self.target_index, page_num, new_count, total
        );
    }

    fn log_new_records(&self, ctx: &SessionContext, new_count: usize) {
        let start = ctx.records.len().saturating_sub(new_count);
        for (i, record) in ctx.records[start..].iter().take(3).enumerate() {
            info!(
                "[目标 {}]   {}. {} | {}",
                self.target_index,
                i + 1,
                record.permit_id().unwrap_or("?"),
                record.address().unwrap_or("?")
            );
        }
    }

    fn log_session_end(&self, ctx: &SessionContext) {
        match ctx.outcome {
            Some(SessionOutcome::Success) => info!(
                "[目标 {}] ✅ 会话成功: {} 条记录, 丢弃 {} 条",
                self.target_index,
                ctx.records.len(),
                ctx.rejected_count
            ),
            Some(SessionOutcome::Exhausted) => info!(
                "[目标 {}] 📭 会话穷尽: 零记录 (丢弃 {} 条)",
                self.target_index, ctx.rejected_count
            ),
            Some(SessionOutcome::Failed) => warn!("[目标 {}] ❌ 会话失败", self.target_index),
            None => warn!("[目标 {}] ⚠️ 会话未收束", self.target_index),
        }
    }
}

/// 页面文本指纹，用于"内容变了没有"的廉价判断
fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// 扫描拦截页标记，命中返回标记文本
fn detect_block<'a>(page_text: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .find(|m| !m.is_empty() && page_text.contains(m.as_str()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_distinguishes_content() {
        assert_eq!(fingerprint("page one"), fingerprint("page one"));
        assert_ne!(fingerprint("page one"), fingerprint("page two"));
    }

    #[test]
    fn test_detect_block() {
        let markers = vec!["Access Denied".to_string(), "unusual traffic".to_string()];
        assert_eq!(
            detect_block("Error: Access Denied by policy", &markers),
            Some("Access Denied")
        );
        assert!(detect_block("Permit Search Results", &markers).is_none());
        assert!(detect_block("anything", &[]).is_none());
    }
}
