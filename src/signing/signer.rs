//! 请求签名器
//!
//! 每次请求：生成随机 nonce 和 challenge，记录时间戳，求解 PoW，
//! 计算请求体 SHA256，按固定顺序用 `:` 拼接规范消息，
//! 最后用派生密钥做 HMAC-SHA256，产出六个签名请求头。
//!
//! challenge 与 solution 一一对应，每次调用都重新生成，绝不复用。

use super::fingerprint::{random_hex, DeviceFingerprint};
use super::key_material::SigningKeyMaterial;
use super::pow::{ProofOfWorkSolver, DEFAULT_DIFFICULTY};
use crate::providers::ProviderError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_FINGERPRINT: &str = "X-Fingerprint";
pub const HEADER_POW_CHALLENGE: &str = "X-PoW-Challenge";
pub const HEADER_POW_SOLUTION: &str = "X-PoW-Solution";

/// PoW 求解失败后的默认重试次数
pub const DEFAULT_POW_RETRY_LIMIT: u32 = 3;

/// 规范消息分隔符
const DELIMITER: &str = ":";

/// 随机 nonce / challenge 的字节长度
const RANDOM_BYTES: usize = 32;

/// 参与签名的全部输入
#[derive(Debug, Clone, Copy)]
pub struct SignatureInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Unix 时间戳（秒）
    pub timestamp: i64,
    pub nonce: &'a str,
    pub fingerprint: &'a str,
    pub solution: &'a str,
    pub body: &'a [u8],
}

impl SignatureInput<'_> {
    /// 规范消息：`method:path:timestamp:nonce:fingerprint:solution:sha256(body)`
    pub fn canonical_message(&self) -> String {
        let timestamp = self.timestamp.to_string();
        let body_hash = body_hash(self.body);
        [
            self.method,
            self.path,
            timestamp.as_str(),
            self.nonce,
            self.fingerprint,
            self.solution,
            body_hash.as_str(),
        ]
        .join(DELIMITER)
    }
}

/// 请求体 SHA256（小写 hex）
pub fn body_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// 对规范消息计算 HMAC-SHA256（小写 hex）
pub fn compute_signature(
    key: &SigningKeyMaterial,
    input: &SignatureInput<'_>,
) -> Result<String, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| ProviderError::ConfigurationError(format!("HMAC 密钥无效: {}", e)))?;
    mac.update(input.canonical_message().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// 签名结果（六个请求头的值）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
    pub fingerprint: String,
    pub challenge: String,
    pub solution: String,
}

impl SignedHeaders {
    /// 请求头名称与取值
    pub fn header_pairs(&self) -> [(&'static str, &str); 6] {
        [
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
            (HEADER_NONCE, self.nonce.as_str()),
            (HEADER_SIGNATURE, self.signature.as_str()),
            (HEADER_FINGERPRINT, self.fingerprint.as_str()),
            (HEADER_POW_CHALLENGE, self.challenge.as_str()),
            (HEADER_POW_SOLUTION, self.solution.as_str()),
        ]
    }
}

/// 请求签名器
///
/// 密钥和指纹在启动时构造一次，之后通过 `Arc` 只读共享；
/// 克隆签名器只增加引用计数。
#[derive(Debug, Clone)]
pub struct RequestSigner {
    key: Arc<SigningKeyMaterial>,
    fingerprint: Arc<DeviceFingerprint>,
    solver: ProofOfWorkSolver,
    difficulty: u32,
    pow_retry_limit: u32,
}

impl RequestSigner {
    pub fn new(
        key: Arc<SigningKeyMaterial>,
        fingerprint: Arc<DeviceFingerprint>,
        solver: ProofOfWorkSolver,
    ) -> Self {
        Self {
            key,
            fingerprint,
            solver,
            difficulty: DEFAULT_DIFFICULTY,
            pow_retry_limit: DEFAULT_POW_RETRY_LIMIT,
        }
    }

    /// 设置 PoW 难度
    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// 设置 PoW 失败后的重试次数
    pub fn with_pow_retry_limit(mut self, limit: u32) -> Self {
        self.pow_retry_limit = limit;
        self
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// 用给定的 nonce / challenge / 时间戳签名
    ///
    /// 纯函数部分，便于用固定输入复现签名。
    pub fn sign_with(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: i64,
        nonce: &str,
        challenge: &str,
    ) -> Result<SignedHeaders, ProviderError> {
        let pow = self.solver.solve(challenge, self.difficulty)?;
        let input = SignatureInput {
            method,
            path,
            timestamp,
            nonce,
            fingerprint: self.fingerprint.as_str(),
            solution: &pow.solution,
            body,
        };
        let signature = compute_signature(&self.key, &input)?;

        debug!(
            "[SIGNER] {} {} 签名完成, PoW 尝试 {} 次",
            method, path, pow.attempts
        );

        Ok(SignedHeaders {
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            signature,
            fingerprint: self.fingerprint.as_str().to_string(),
            challenge: challenge.to_string(),
            solution: pow.solution,
        })
    }

    /// 同步签名（CPU 密集，阻塞当前线程）
    ///
    /// PoW 超出尝试上限时换新的 challenge 和 nonce 重试，
    /// 最多重试 `pow_retry_limit` 次。
    pub fn sign_blocking(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<SignedHeaders, ProviderError> {
        let mut round = 0;
        loop {
            let nonce = random_hex(RANDOM_BYTES);
            let challenge = random_hex(RANDOM_BYTES);
            let timestamp = chrono::Utc::now().timestamp();

            match self.sign_with(method, path, body, timestamp, &nonce, &challenge) {
                Err(ProviderError::PowExhausted { attempts, .. }) if round < self.pow_retry_limit => {
                    round += 1;
                    warn!(
                        "[SIGNER] PoW 在 {} 次尝试内未找到解，重新生成 challenge（第 {} 次重试）",
                        attempts, round
                    );
                }
                other => return other,
            }
        }
    }

    /// 异步签名
    ///
    /// 在 `spawn_blocking` 线程池上执行，不占用 I/O 线程。
    pub async fn sign(
        &self,
        method: &str,
        path: &str,
        body: bytes::Bytes,
    ) -> Result<SignedHeaders, ProviderError> {
        let signer = self.clone();
        let method = method.to_string();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || signer.sign_blocking(&method, &path, &body)).await?
    }
}
