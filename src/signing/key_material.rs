//! HMAC 签名密钥派生
//!
//! 上游前端把密钥拆成若干片段，拼接后逐字节与 `42 + index % 7` 异或，
//! 再做标准 Base64 编码。上游按字节校验签名，片段顺序、异或常量、
//! 编码方式任何一处不同都会得到被拒绝的签名。

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// 密钥片段（按上游前端的拼接顺序）
pub const KEY_FRAGMENTS: [&str; 10] = [
    "MegaLLM", "_public", "_key", "_2025", "c2VjdX", "_v2", "_hmac", "_sig", "_final", "_32",
];

/// 异或基数
const XOR_BASE: u8 = 42;
/// 异或周期
const XOR_PERIOD: usize = 7;

/// 派生后的签名密钥
///
/// 进程启动时计算一次，之后只读共享。
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKeyMaterial {
    encoded: String,
}

impl SigningKeyMaterial {
    /// 从内置片段派生
    pub fn derive() -> Self {
        Self::from_fragments(&KEY_FRAGMENTS)
    }

    /// 从任意片段派生（用于接入片段不同的上游）
    pub fn from_fragments(fragments: &[&str]) -> Self {
        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.bytes()).collect();
        Self {
            encoded: BASE64.encode(obfuscate(&joined)),
        }
    }

    /// 编码后的密钥字符串，HMAC 使用其 UTF-8 字节作为 key
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// HMAC key 字节
    pub fn as_bytes(&self) -> &[u8] {
        self.encoded.as_bytes()
    }
}

impl std::fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyMaterial")
            .field("len", &self.encoded.len())
            .finish()
    }
}

/// 逐字节异或 `42 + index % 7`
fn obfuscate(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .enumerate()
        .map(|(idx, b)| b ^ (XOR_BASE + (idx % XOR_PERIOD) as u8))
        .collect()
}
