//! 上游厂商描述
//!
//! 把一个厂商集成描述成数据：地址、凭证附加方式、静态请求头/请求体字段、
//! 联网搜索开关以及行标签映射。请求体在这里序列化为紧凑 JSON，
//! 签名的字节就是发送的字节。

use super::error::ProviderError;
use crate::models::openai::ChatCompletionRequest;
use crate::streaming::TagScheme;
use bytes::Bytes;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_VENDOR_NAME: &str = "megallm";
pub const DEFAULT_BASE_URL: &str = "https://megallm.io";
pub const DEFAULT_CHAT_PATH: &str = "/api/chat";
pub const DEFAULT_SESSION_COOKIE: &str = "__Secure-next-auth.session-token";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// 凭证附加方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialAttachment {
    /// `Cookie: <name>=<secret>`
    Cookie {
        #[serde(default = "default_cookie_name")]
        name: String,
    },
    /// `Authorization: Bearer <secret>`
    Bearer,
}

fn default_cookie_name() -> String {
    DEFAULT_SESSION_COOKIE.to_string()
}

impl Default for CredentialAttachment {
    fn default() -> Self {
        CredentialAttachment::Cookie {
            name: default_cookie_name(),
        }
    }
}

impl CredentialAttachment {
    /// 生成携带凭证的请求头
    pub fn header(&self, secret: &str) -> (String, String) {
        match self {
            CredentialAttachment::Cookie { name } => {
                ("Cookie".to_string(), format!("{}={}", name, secret))
            }
            CredentialAttachment::Bearer => {
                ("Authorization".to_string(), format!("Bearer {}", secret))
            }
        }
    }
}

/// 联网搜索开关
///
/// 模型名带指定后缀时去掉后缀，并把请求体里的布尔字段置为 true。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSearchToggle {
    pub model_suffix: String,
    pub field: String,
}

impl Default for WebSearchToggle {
    fn default() -> Self {
        Self {
            model_suffix: "-Web".to_string(),
            field: "isWebSearchEnabled".to_string(),
        }
    }
}

/// 厂商配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorProfile {
    pub name: String,
    pub base_url: String,
    pub chat_path: String,
    pub credential: CredentialAttachment,
    /// 是否附加会话级签名头（currentTime / sign）
    pub session_signature: bool,
    pub extra_headers: BTreeMap<String, String>,
    /// 合并进每个请求体的静态字段，不会覆盖生成的字段
    pub extra_body: Map<String, Value>,
    pub web_search: Option<WebSearchToggle>,
    pub tags: TagScheme,
}

impl Default for VendorProfile {
    fn default() -> Self {
        let mut extra_headers = BTreeMap::new();
        extra_headers.insert(
            "Accept-Language".to_string(),
            "zh-CN,zh;q=0.9".to_string(),
        );
        extra_headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());

        let mut extra_body = Map::new();
        extra_body.insert("signal".to_string(), json!({}));

        Self {
            name: DEFAULT_VENDOR_NAME.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            credential: CredentialAttachment::default(),
            session_signature: true,
            extra_headers,
            extra_body,
            web_search: None,
            tags: TagScheme::default(),
        }
    }
}

impl VendorProfile {
    /// 完整的聊天接口 URL
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.chat_path)
    }

    /// 实际请求的路径，签名覆盖的就是它
    ///
    /// `base_url` 带路径前缀时（如 `https://host/proxy`）前缀也计入。
    pub fn request_path(&self) -> String {
        let prefix = url::Url::parse(&self.base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        format!("{}{}", prefix, self.chat_path)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ProviderError> {
        let parsed = url::Url::parse(&self.base_url).map_err(|e| {
            ProviderError::ConfigurationError(format!("无效的 base_url '{}': {}", self.base_url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderError::ConfigurationError(format!(
                "base_url 只支持 http/https: {}",
                self.base_url
            )));
        }
        if !self.chat_path.starts_with('/') {
            return Err(ProviderError::ConfigurationError(format!(
                "chat_path 必须以 '/' 开头: {}",
                self.chat_path
            )));
        }
        if let CredentialAttachment::Cookie { name } = &self.credential {
            if name.trim().is_empty() {
                return Err(ProviderError::ConfigurationError(
                    "cookie 名不能为空".to_string(),
                ));
            }
        }
        self.tags
            .validate()
            .map_err(ProviderError::ConfigurationError)
    }

    /// 解析模型名和联网搜索开关
    pub fn resolve_model<'a>(&self, model: &'a str) -> (&'a str, Option<bool>) {
        match &self.web_search {
            Some(toggle) if !toggle.model_suffix.is_empty() => {
                match model.strip_suffix(toggle.model_suffix.as_str()) {
                    Some(base) => (base, Some(true)),
                    None => (model, Some(false)),
                }
            }
            _ => (model, None),
        }
    }

    /// 构造上游请求体
    ///
    /// 历史中的助手消息按顺序复用 `assistant_ids`，不够时生成新 id。
    pub fn build_body(
        &self,
        request: &ChatCompletionRequest,
        conversation_id: &str,
        assistant_ids: &[String],
    ) -> Result<Bytes, ProviderError> {
        let created_at = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut recorded = assistant_ids.iter();

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                let id = match message.role.as_str() {
                    "assistant" => recorded
                        .next()
                        .cloned()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    _ => uuid::Uuid::new_v4().to_string(),
                };
                json!({
                    "id": id,
                    "role": message.role,
                    "content": message.content,
                    "createdAt": created_at,
                    "parts": [{ "type": "text", "text": message.content }],
                })
            })
            .collect();

        let (model, web_search) = self.resolve_model(&request.model);

        let mut body = self.extra_body.clone();
        body.insert("id".to_string(), json!(conversation_id));
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert("stream".to_string(), json!(true));
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let (Some(enabled), Some(toggle)) = (web_search, &self.web_search) {
            body.insert(toggle.field.clone(), json!(enabled));
        }

        Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
    }

    /// 每个请求都带的静态请求头
    pub fn static_headers(&self) -> Vec<(String, String)> {
        let base = self.base_url.trim_end_matches('/');
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];
        if !self.has_extra_header("Origin") {
            headers.push(("Origin".to_string(), base.to_string()));
        }
        if !self.has_extra_header("Referer") {
            headers.push(("Referer".to_string(), format!("{}/", base)));
        }
        headers.extend(
            self.extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        headers
    }

    fn has_extra_header(&self, name: &str) -> bool {
        self.extra_headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(name))
    }
}
