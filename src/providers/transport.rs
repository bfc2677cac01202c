//! 上游 HTTP 调用
//!
//! `VendorTransport` 是 AdapterService 和网络之间的接缝，测试里用脚本化的实现替换。

use super::error::{truncate_message, ProviderError};
use crate::streaming::{reqwest_stream_to_stream_response, StreamResponse};
use crate::telemetry::sanitize;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};

/// 一次已签名的上游请求
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamRequest {
    /// 按名称（忽略大小写）查找请求头
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 上游传输
#[async_trait]
pub trait VendorTransport: Send + Sync {
    /// 发送请求，成功时返回响应体字节流
    ///
    /// 非 2xx 状态码映射为对应的 `ProviderError`（401/403 → `AuthenticationRejected`）。
    async fn dispatch(&self, request: UpstreamRequest) -> Result<StreamResponse, ProviderError>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::ConfigurationError(format!("HTTP 客户端创建失败: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, ProviderError> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ProviderError::ConfigurationError(format!("无效的请求头名 '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ProviderError::ConfigurationError(format!("请求头 {} 的值无效: {}", name, e))
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl VendorTransport for HttpTransport {
    async fn dispatch(&self, request: UpstreamRequest) -> Result<StreamResponse, ProviderError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            ProviderError::ConfigurationError(format!("无效的请求方法 '{}': {}", request.method, e))
        })?;
        let headers = Self::header_map(&request.headers)?;

        debug!(
            "[TRANSPORT] {} {} ({} bytes)",
            request.method,
            request.url,
            request.body.len()
        );

        let response = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = sanitize(&body);
            warn!(
                "[TRANSPORT] 上游返回 {}: {}",
                status.as_u16(),
                truncate_message(&body, 200)
            );
            return Err(ProviderError::from_http_status(status.as_u16(), &body));
        }

        Ok(reqwest_stream_to_stream_response(response))
    }
}
