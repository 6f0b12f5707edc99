use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 提取策略标签
///
/// `Structured`：按行选择器做确定性 DOM 提取；
/// `NaturalLanguage`：整页文本交给提取后端，结果过可信度过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionPolicy {
    Structured,
    NaturalLanguage,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        ExtractionPolicy::Structured
    }
}

/// 本次运行的检索条件（由 CLI 模式参数盖章，不写在门户文件里）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SearchCriteria {
    Address { query: String },
    DateRange { start: NaiveDate, end: NaiveDate },
}

impl SearchCriteria {
    /// 日志用的一行描述
    pub fn describe(&self) -> String {
        match self {
            SearchCriteria::Address { query } => format!("地址检索: {}", query),
            SearchCriteria::DateRange { start, end } => {
                format!("日期范围: {} ~ {}", start, end)
            }
        }
    }
}

/// 登录计划：凭据 + 选择器 + 登录成功信号
///
/// 核心不解释其中任何选择器的含义，只按顺序交给驱动执行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPlan {
    pub username: String,
    pub password: String,
    pub username_input: String,
    pub password_input: String,
    pub submit_button: String,
    /// 登录成功后应出现的元素
    #[serde(default)]
    pub success_selector: Option<String>,
    /// 登录成功后 URL 应包含的片段
    #[serde(default)]
    pub success_url_fragment: Option<String>,
}

/// 检索表单计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPlan {
    /// 地址输入框（地址检索模式）
    #[serde(default)]
    pub address_input: Option<String>,
    /// 日期起止输入框（日期范围模式）
    #[serde(default)]
    pub date_from_input: Option<String>,
    #[serde(default)]
    pub date_to_input: Option<String>,
    pub submit_button: String,
    /// 结果区域出现 = 提交完成信号
    #[serde(default)]
    pub results_marker: Option<String>,
    /// 加载指示器消失 = 提交完成的次选信号
    #[serde(default)]
    pub loading_marker: Option<String>,
}

/// 结构化提取的行计划：行选择器 + 字段名到单元格选择器的映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPlan {
    pub row_selector: String,
    pub columns: BTreeMap<String, String>,
}

/// 一个批次工作单元：一座城市门户 + 该门户的全部导航计划
///
/// 从 TOML 文件夹逐文件加载（见 loaders/toml_loader.rs），
/// 加载时由运行参数盖上检索条件，此后不再变更。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// 城市标识（用作去重键、队列键、日志前缀）
    pub id: String,
    pub portal_name: String,
    pub entry_url: String,
    /// 提取任务描述，传给自然语言后端；缺省时按门户名生成
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub auth: Option<AuthPlan>,
    pub search: SearchPlan,
    /// 结构化策略必需；自然语言策略可省
    #[serde(default)]
    pub rows: Option<RowPlan>,
    /// 翻页按钮；缺省 = 单页门户
    #[serde(default)]
    pub next_button: Option<String>,
    #[serde(default)]
    pub policy: ExtractionPolicy,
    /// 预期记录数上限；Some(0) 表示显式的零结果预期
    #[serde(default)]
    pub quota: Option<u32>,
    /// 识别为拦截页/验证页的文本标记
    #[serde(default)]
    pub blocked_markers: Vec<String>,
    /// 本次运行的检索条件（加载后盖章）
    #[serde(default)]
    pub criteria: Option<SearchCriteria>,
}

impl Target {
    /// 登录计划：仅在 requires_auth 时生效
    pub fn auth_plan(&self) -> Option<&AuthPlan> {
        if self.requires_auth {
            self.auth.as_ref()
        } else {
            None
        }
    }

    /// 提取任务描述（缺省时生成）
    pub fn task_description(&self) -> String {
        match &self.task {
            Some(t) => t.clone(),
            None => format!(
                "Extract building permit records from the {} portal",
                self.portal_name
            ),
        }
    }

    /// 是否设置了正数配额
    pub fn has_positive_quota(&self) -> bool {
        matches!(self.quota, Some(n) if n > 0)
    }
}
