//! 会话级签名
//!
//! `sign = md5(conversation_id + 毫秒时间戳 + salt)`，
//! 和每次请求的 PoW/HMAC 签名相互独立，用来证明会话连续性。
//! 上游按时间窗口校验，所以每次出站请求前都要重新生成。

use serde::{Deserialize, Serialize};

/// 上游前端公开的盐值
pub const DEFAULT_SESSION_SALT: &str = "@!~chatbot.0868";

pub const HEADER_CURRENT_TIME: &str = "currentTime";
pub const HEADER_SIGN: &str = "sign";

/// 一次会话签名的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureContext {
    pub conversation_id: String,
    pub signature: String,
    pub issued_at_millis: i64,
}

impl SignatureContext {
    /// 请求头名称与取值
    pub fn header_pairs(&self) -> [(&'static str, String); 2] {
        [
            (HEADER_CURRENT_TIME, self.issued_at_millis.to_string()),
            (HEADER_SIGN, self.signature.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SessionSigner {
    salt: String,
}

impl Default for SessionSigner {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_SALT)
    }
}

impl SessionSigner {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    pub fn sign(&self, conversation_id: &str, now_millis: i64) -> SignatureContext {
        let input = format!("{}{}{}", conversation_id, now_millis, self.salt);
        SignatureContext {
            conversation_id: conversation_id.to_string(),
            signature: format!("{:x}", md5::compute(input.as_bytes())),
            issued_at_millis: now_millis,
        }
    }
}
