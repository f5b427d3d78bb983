//! 通知子系统错误类型
//!
//! 所有错误都在子系统内部被吸收（记录日志后继续），只有直接调用
//! `NotificationApi` 的代码才会拿到这些错误。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Push 通道不可用（能力缺失、连接被拒、库错误），静默回退到轮询
    #[error("push transport unavailable: {0}")]
    TransportUnavailable(String),

    /// HTTP 请求失败（网络错误、超时）
    #[error("request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    /// 服务端返回非 2xx
    #[error("request to {endpoint} returned HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    /// 获取偏好失败，调用方应替换为 fail-open 默认值
    #[error("preference fetch failed: {0}")]
    PreferenceFetchFailed(String),

    /// 响应体或 push 载荷无法解析
    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),
}

impl NotifyError {
    pub fn request(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        NotifyError::RequestFailed {
            endpoint: endpoint.into(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(e: serde_json::Error) -> Self {
        NotifyError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;
