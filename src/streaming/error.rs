//! 流式传输错误类型
//!
//! 上游响应体读取、逐行解析和状态机推进过程中可能出现的错误。
//! 除 `MalformedLine` 外都会终止读取，但调用方仍会收到完整的收尾序列。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 流式传输错误类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum StreamError {
    /// 网络错误
    ///
    /// 读取响应体时连接失败或被重置。
    Network(String),

    /// 超时错误
    ///
    /// 整体超时或两个 chunk 之间的空闲超时。
    Timeout,

    /// 无法识别的行
    ///
    /// 标签未知或载荷无法解析。只记录并跳过，不会终止流。
    MalformedLine {
        /// 原始行（已截断）
        line: String,
        /// 原因
        reason: String,
    },

    /// 协议违例
    ///
    /// 例如上游在没有结束标记的情况下关闭连接。
    ProtocolViolation(String),

    /// 客户端断开连接
    ClientDisconnected,

    /// 缓冲区溢出
    ///
    /// 单个未结束的行超过配置的缓冲区大小。
    BufferOverflow,

    /// 内部错误
    Internal(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Network(msg) => write!(f, "网络错误: {}", msg),
            StreamError::Timeout => write!(f, "流式响应超时"),
            StreamError::MalformedLine { line, reason } => {
                write!(f, "无法解析的行 ({}): {}", reason, line)
            }
            StreamError::ProtocolViolation(msg) => write!(f, "协议违例: {}", msg),
            StreamError::ClientDisconnected => write!(f, "客户端已断开连接"),
            StreamError::BufferOverflow => write!(f, "缓冲区溢出"),
            StreamError::Internal(msg) => write!(f, "内部错误: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

// ============================================================================
// From trait 实现 - 用于错误转换
// ============================================================================

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Network(err.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else if err.is_connect() {
            StreamError::Network(format!("连接失败: {}", err))
        } else {
            StreamError::Network(err.to_string())
        }
    }
}

// ============================================================================
// 辅助方法
// ============================================================================

impl StreamError {
    /// 创建网络错误
    pub fn network(msg: impl Into<String>) -> Self {
        StreamError::Network(msg.into())
    }

    /// 创建行解析错误，原始行截断到 200 字节
    pub fn malformed(line: &str, reason: impl Into<String>) -> Self {
        StreamError::MalformedLine {
            line: crate::providers::error::truncate_message(line, 200),
            reason: reason.into(),
        }
    }

    /// 创建内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        StreamError::Internal(msg.into())
    }

    /// 是否会终止读取
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamError::MalformedLine { .. })
    }

    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Network(_) | StreamError::Timeout)
    }

    /// 转换为 SSE 错误事件格式
    pub fn to_sse_error(&self) -> String {
        let error_json = serde_json::json!({
            "error": {
                "type": self.error_type_string(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        });
        format!("event: error\ndata: {}\n\n", error_json)
    }

    /// 获取错误类型字符串
    pub fn error_type_string(&self) -> &'static str {
        match self {
            StreamError::Network(_) => "upstream_transport_error",
            StreamError::Timeout => "upstream_timeout",
            StreamError::MalformedLine { .. } => "malformed_upstream_line",
            StreamError::ProtocolViolation(_) => "translator_protocol_violation",
            StreamError::ClientDisconnected => "client_disconnected",
            StreamError::BufferOverflow => "buffer_overflow",
            StreamError::Internal(_) => "internal_error",
        }
    }
}

// ============================================================================
// 测试模块
// ============================================================================
