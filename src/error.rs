use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 请求格式错误（400，不重试）
    #[error("请求校验失败: {0}")]
    Validation(String),
    /// 幂等键复用但请求内容不同（409）
    #[error("幂等键冲突: {key}")]
    IdempotencyConflict { key: String },
    /// 外部模型服务错误
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// KV 存储错误
    #[error("存储错误: {0}")]
    Store(String),
    /// 配置错误
    #[error("配置错误 ({path}): {message}")]
    Config { path: String, message: String },
    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("文件错误: {0}")]
    Io(#[from] std::io::Error),
    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

/// 外部模型服务（识图 / 文本）错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// 调用超时（可重试）
    #[error("timeout after {0}ms")]
    Timeout(u64),
    /// 网络层失败（可重试）
    #[error("transport error: {0}")]
    Transport(String),
    /// 服务商返回错误
    #[error("provider error: {0}")]
    Api(String),
    /// 返回内容为空
    #[error("empty content from {0}")]
    EmptyContent(String),
    /// 调用成功但内容不可用（错误签名 / 拒答 / JSON 无法解析）
    #[error("unusable output: {0}")]
    Semantic(String),
}

impl ProviderError {
    /// 网络 / 超时类错误可以对同一服务商重试
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Transport(_))
    }

    /// 是否像服务商侧拉取图片失败
    pub fn looks_like_fetch_failure(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Transport(_) => true,
            ProviderError::Api(msg) => {
                let msg = msg.to_lowercase();
                ["download", "fetch", "image url", "timeout", "timed out", "invalid url"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Config {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
