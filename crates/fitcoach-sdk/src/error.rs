use thiserror::Error;

/// SDK 统一错误类型
#[derive(Debug, Error)]
pub enum FitcoachSDKError {
    /// 查询/命令因网络问题失败（可重试，不自动重试）
    #[error("Transient network error: {0}")]
    TransientNetwork(String),
    /// 全量刷新时单个联系人的消息/未读查询失败
    #[error("Partial load error for contact {contact_id}: {message}")]
    PartialLoad { contact_id: u64, message: String },
    /// 实时通道断开
    #[error("Subscription dropped: {0}")]
    SubscriptionDropped(String),
    /// 更新事件引用了本地尚未加载的消息
    #[error("Stale state divergence: message {0} is not known locally")]
    StaleStateDivergence(u64),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<sled::Error> for FitcoachSDKError {
    fn from(error: sled::Error) -> Self {
        FitcoachSDKError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for FitcoachSDKError {
    fn from(error: serde_json::Error) -> Self {
        FitcoachSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FitcoachSDKError {
    fn from(error: std::io::Error) -> Self {
        FitcoachSDKError::IO(error.to_string())
    }
}

impl FitcoachSDKError {
    /// 是否值得由用户/上层再次触发（SDK 自身从不自动重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FitcoachSDKError::TransientNetwork(_)
                | FitcoachSDKError::PartialLoad { .. }
                | FitcoachSDKError::SubscriptionDropped(_)
        )
    }

    /// 便捷构造：网络类错误
    pub fn network<S: Into<String>>(message: S) -> Self {
        FitcoachSDKError::TransientNetwork(message.into())
    }
}

pub type Result<T> = std::result::Result<T, FitcoachSDKError>;
