//! 统一的 Provider 错误类型
//!
//! 覆盖签名、凭证池、会话和上游调用的全部失败语义，区分可重试和不可重试错误，
//! 并提供对外统一的结构化错误对象。

use std::error::Error;
use std::fmt;

/// Provider 统一错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// PoW 在尝试上限内没有找到解（临时错误，重新生成 challenge 即可重试）
    PowExhausted {
        /// 实际尝试次数
        attempts: u64,
        /// 难度
        difficulty: u32,
    },

    /// 上游拒绝认证（401/403）
    ///
    /// 调用方会刷新一次会话后重试，第二次仍失败则直接返回
    AuthenticationRejected(String),

    /// 凭证池为空
    NoCredentialsAvailable,

    /// 上游传输错误（超时、连接失败、连接被重置）
    UpstreamTransportError {
        /// 错误详情
        message: String,
        /// 是否为超时
        timeout: bool,
    },

    /// 限流错误（429）
    RateLimitError(String),

    /// 上游服务器错误（5xx）
    ServerError(String),

    /// 请求错误（其余 4xx）
    RequestError(String),

    /// 配置错误
    ConfigurationError(String),

    /// 解析错误
    ParseError(String),

    /// 未知错误
    Unknown(String),
}

impl ProviderError {
    /// 判断错误是否可重试
    ///
    /// 认证错误不在此列：它的一次性刷新重试由 AdapterService 自己处理
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::PowExhausted { .. }
                | ProviderError::UpstreamTransportError { .. }
                | ProviderError::ServerError(_)
                | ProviderError::RateLimitError(_)
        )
    }

    /// 是否为认证类错误
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::AuthenticationRejected(_))
    }

    /// 机器可读的错误类型
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::PowExhausted { .. } => "pow_exhausted",
            ProviderError::AuthenticationRejected(_) => "authentication_rejected",
            ProviderError::NoCredentialsAvailable => "no_credentials_available",
            ProviderError::UpstreamTransportError { timeout: true, .. } => "upstream_timeout",
            ProviderError::UpstreamTransportError { .. } => "upstream_transport_error",
            ProviderError::RateLimitError(_) => "rate_limited",
            ProviderError::ServerError(_) => "upstream_server_error",
            ProviderError::RequestError(_) => "invalid_request",
            ProviderError::ConfigurationError(_) => "configuration_error",
            ProviderError::ParseError(_) => "parse_error",
            ProviderError::Unknown(_) => "unknown_error",
        }
    }

    /// 对外返回的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            ProviderError::PowExhausted { .. } => 503,
            ProviderError::AuthenticationRejected(_) => 401,
            ProviderError::NoCredentialsAvailable => 503,
            ProviderError::UpstreamTransportError { timeout: true, .. } => 504,
            ProviderError::UpstreamTransportError { .. } => 502,
            ProviderError::RateLimitError(_) => 429,
            ProviderError::ServerError(_) => 502,
            ProviderError::RequestError(_) => 400,
            ProviderError::ConfigurationError(_) => 500,
            ProviderError::ParseError(_) => 502,
            ProviderError::Unknown(_) => 500,
        }
    }

    /// 统一的结构化错误对象
    pub fn to_error_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        })
    }

    /// 从 HTTP 状态码创建错误
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {} - {}", status, truncate_message(body, 200));
        match status {
            401 | 403 => ProviderError::AuthenticationRejected(detail),
            429 => ProviderError::RateLimitError(detail),
            408 | 504 => ProviderError::UpstreamTransportError {
                message: detail,
                timeout: true,
            },
            400..=499 => ProviderError::RequestError(detail),
            500..=599 => ProviderError::ServerError(detail),
            _ => ProviderError::Unknown(detail),
        }
    }

    /// 从 reqwest 错误创建
    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::UpstreamTransportError {
                message: "请求超时".to_string(),
                timeout: true,
            }
        } else if err.is_connect() {
            ProviderError::UpstreamTransportError {
                message: format!("无法连接到服务器: {}", err),
                timeout: false,
            }
        } else if err.is_decode() {
            ProviderError::ParseError("响应解码失败".to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_http_status(status.as_u16(), &err.to_string())
        } else {
            ProviderError::UpstreamTransportError {
                message: err.to_string(),
                timeout: false,
            }
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::PowExhausted {
                attempts,
                difficulty,
            } => write!(
                f,
                "PoW 求解失败：{} 次尝试内未找到难度 {} 的解",
                attempts, difficulty
            ),
            ProviderError::AuthenticationRejected(msg) => {
                write!(f, "上游认证失败。详情：{}", msg)
            }
            ProviderError::NoCredentialsAvailable => {
                write!(f, "没有可用的 session token，请检查配置文件")
            }
            ProviderError::UpstreamTransportError {
                message,
                timeout: true,
            } => write!(f, "上游请求超时。详情：{}", message),
            ProviderError::UpstreamTransportError { message, .. } => {
                write!(f, "上游连接失败。详情：{}", message)
            }
            ProviderError::RateLimitError(msg) => {
                write!(f, "请求过于频繁，请稍后重试。详情：{}", msg)
            }
            ProviderError::ServerError(msg) => {
                write!(f, "上游服务暂时不可用。详情：{}", msg)
            }
            ProviderError::RequestError(msg) => write!(f, "请求失败。详情：{}", msg),
            ProviderError::ConfigurationError(msg) => write!(f, "配置错误。详情：{}", msg),
            ProviderError::ParseError(msg) => write!(f, "数据解析失败。详情：{}", msg),
            ProviderError::Unknown(msg) => write!(f, "发生未知错误。详情：{}", msg),
        }
    }
}

impl Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::from_reqwest_error(&err)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::ParseError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProviderError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProviderError::Unknown(format!("后台任务失败: {}", err))
    }
}

impl From<crate::streaming::StreamError> for ProviderError {
    fn from(err: crate::streaming::StreamError) -> Self {
        use crate::streaming::StreamError;
        match err {
            StreamError::Timeout => ProviderError::UpstreamTransportError {
                message: err.to_string(),
                timeout: true,
            },
            StreamError::Network(message) => ProviderError::UpstreamTransportError {
                message,
                timeout: false,
            },
            StreamError::MalformedLine { .. }
            | StreamError::ProtocolViolation(_)
            | StreamError::BufferOverflow => ProviderError::ParseError(err.to_string()),
            StreamError::ClientDisconnected | StreamError::Internal(_) => {
                ProviderError::Unknown(err.to_string())
            }
        }
    }
}

/// 截断消息到指定长度（按字符边界）
pub(crate) fn truncate_message(msg: &str, max_len: usize) -> String {
    if msg.len() <= max_len {
        return msg.to_string();
    }
    let mut end = max_len;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &msg[..end])
}
