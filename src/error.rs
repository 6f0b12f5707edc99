use std::fmt;

/// 应用程序错误类型
#[derive(Debug)]
pub enum AppError {
    /// 会话相关错误（导航 / 登录 / 提交）
    Session(SessionError),
    /// 提取后端错误（LLM 调用）
    Backend(BackendError),
    /// 复核队列错误
    Queue(QueueError),
    /// 文件操作错误
    File(FileError),
    /// 配置错误
    Config(ConfigError),
    /// 其他错误（用于包装第三方库错误）
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Session(e) => write!(f, "会话错误: {}", e),
            AppError::Backend(e) => write!(f, "提取后端错误: {}", e),
            AppError::Queue(e) => write!(f, "复核队列错误: {}", e),
            AppError::File(e) => write!(f, "文件错误: {}", e),
            AppError::Config(e) => write!(f, "配置错误: {}", e),
            AppError::Other(msg) => write!(f, "错误: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Session(e) => Some(e),
            AppError::Backend(e) => Some(e),
            AppError::Queue(e) => Some(e),
            AppError::File(e) => Some(e),
            AppError::Config(e) => Some(e),
            AppError::Other(_) => None,
        }
    }
}

/// 会话相关错误
///
/// 只包含"让会话无法在有限时间内到达终态"的错误；
/// 翻页循环内部可吸收的错误不在此列。
#[derive(Debug)]
pub enum SessionError {
    /// 导航失败（网络 / CDP 层面）
    NavigationFailed {
        url: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 导航超时（含重试一次后仍超时）
    NavigationTimeout {
        url: String,
        waited_ms: u64,
    },
    /// 登录被拒绝（凭据问题，不重试）
    AuthRejected {
        portal: String,
    },
    /// 提交搜索后等不到内容变化信号
    SubmitTimeout {
        portal: String,
        waited_ms: u64,
    },
    /// 识别到拦截页（反爬 / 验证码 / 封禁提示）
    PageBlocked {
        portal: String,
        marker: String,
    },
    /// 驱动调用失败（执行脚本 / 截图等）
    DriverCallFailed {
        action: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NavigationFailed { url, source } => {
                write!(f, "导航到 {} 失败: {}", url, source)
            }
            SessionError::NavigationTimeout { url, waited_ms } => {
                write!(f, "导航到 {} 超时 (已等待 {} ms)", url, waited_ms)
            }
            SessionError::AuthRejected { portal } => {
                write!(f, "门户 {} 登录被拒绝", portal)
            }
            SessionError::SubmitTimeout { portal, waited_ms } => {
                write!(f, "门户 {} 提交搜索后无内容变化 (已等待 {} ms)", portal, waited_ms)
            }
            SessionError::PageBlocked { portal, marker } => {
                write!(f, "门户 {} 出现拦截页: {}", portal, marker)
            }
            SessionError::DriverCallFailed { action, source } => {
                write!(f, "驱动调用失败 ({}): {}", action, source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::NavigationFailed { source, .. }
            | SessionError::DriverCallFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 提取后端错误
///
/// 后端调用失败只影响当前页（按零条记录处理），不会终止会话。
#[derive(Debug)]
pub enum BackendError {
    /// API 调用失败
    ApiCallFailed {
        model: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 返回结果为空
    EmptyResponse {
        model: String,
    },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::ApiCallFailed { model, source } => {
                write!(f, "提取后端调用失败 (模型: {}): {}", model, source)
            }
            BackendError::EmptyResponse { model } => {
                write!(f, "提取后端返回为空 (模型: {})", model)
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::ApiCallFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 复核队列错误
#[derive(Debug)]
pub enum QueueError {
    /// 条目已被复核过（重复 resolve 是调用方 bug，必须显式报错）
    AlreadyResolved {
        key: String,
    },
    /// 条目不存在
    EntryNotFound {
        key: String,
    },
    /// 存储层失败（必须向上传播，不得吞掉）
    StorageFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 序列化失败
    SerializeFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::AlreadyResolved { key } => {
                write!(f, "条目 {} 已被复核，不能重复 resolve", key)
            }
            QueueError::EntryNotFound { key } => {
                write!(f, "条目不存在: {}", key)
            }
            QueueError::StorageFailed { path, source } => {
                write!(f, "队列存储操作失败 ({}): {}", path, source)
            }
            QueueError::SerializeFailed { source } => {
                write!(f, "队列条目序列化失败: {}", source)
            }
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::StorageFailed { source, .. } | QueueError::SerializeFailed { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 文件操作错误
#[derive(Debug)]
pub enum FileError {
    /// 读取文件失败
    ReadFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 写入文件失败
    WriteFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// TOML 解析失败
    TomlParseFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 目录不存在
    DirectoryNotFound {
        path: String,
    },
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::ReadFailed { path, source } => {
                write!(f, "读取文件失败 ({}): {}", path, source)
            }
            FileError::WriteFailed { path, source } => {
                write!(f, "写入文件失败 ({}): {}", path, source)
            }
            FileError::TomlParseFailed { path, source } => {
                write!(f, "TOML解析失败 ({}): {}", path, source)
            }
            FileError::DirectoryNotFound { path } => write!(f, "目录不存在: {}", path),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileError::ReadFailed { source, .. }
            | FileError::WriteFailed { source, .. }
            | FileError::TomlParseFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 命令行参数非法
    InvalidArgument {
        name: String,
        value: String,
        reason: String,
    },
    /// 缺少必填参数
    MissingArgument {
        name: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidArgument { name, value, reason } => {
                write!(f, "参数 {} 非法: 值 '{}' ({})", name, value, reason)
            }
            ConfigError::MissingArgument { name } => {
                write!(f, "缺少必填参数: {}", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ========== 从常见错误类型转换 ==========
// 注意：不需要手动实现 From<AppError> for anyhow::Error，
// 因为 anyhow 已经为所有实现了 std::error::Error 的类型提供了自动实现

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::Session(SessionError::DriverCallFailed {
            action: "cdp".to_string(),
            source: Box::new(err),
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Queue(QueueError::SerializeFailed {
            source: Box::new(err),
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(), // TOML错误通常不包含路径信息
            source: Box::new(err),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建导航失败错误
    pub fn navigation_failed(url: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::Session(SessionError::NavigationFailed {
            url: url.into(),
            source: Box::new(source),
        })
    }

    /// 创建导航超时错误
    pub fn navigation_timeout(url: impl Into<String>, waited_ms: u64) -> Self {
        AppError::Session(SessionError::NavigationTimeout {
            url: url.into(),
            waited_ms,
        })
    }

    /// 创建驱动调用失败错误
    pub fn driver_call_failed(action: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::Session(SessionError::DriverCallFailed {
            action: action.into(),
            source: Box::new(source),
        })
    }

    /// 创建提取后端调用错误
    pub fn backend_call_failed(model: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::Backend(BackendError::ApiCallFailed {
            model: model.into(),
            source: Box::new(source),
        })
    }

    /// 创建队列存储错误
    pub fn queue_storage_failed(path: impl AsRef<std::path::Path>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::Queue(QueueError::StorageFailed {
            path: path.as_ref().display().to_string(),
            source: Box::new(source),
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl AsRef<std::path::Path>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.as_ref().display().to_string(),
            source: Box::new(source),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
