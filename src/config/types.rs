//! 配置类型定义
//!
//! 所有字段都有默认值，配置文件只需写出要改的部分。

use super::yaml::ConfigError;
use crate::credential::StrategyKind;
use crate::providers::VendorProfile;
use crate::session::{RefreshPolicy, RefreshPolicyKind, DEFAULT_SESSION_SALT};
use crate::signing::pow::{DEFAULT_DIFFICULTY, DEFAULT_MAX_ATTEMPTS};
use crate::signing::signer::DEFAULT_POW_RETRY_LIMIT;
use crate::streaming::StreamConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PoW 难度上限（SHA-256 十六进制摘要长度）
pub const MAX_POW_DIFFICULTY: u32 = 64;

/// 主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    pub signing: SigningConfig,
    pub session: SessionConfig,
    pub vendor: VendorProfile,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vendor
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.signing.pow_difficulty > MAX_POW_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "signing.pow_difficulty 不能超过 {}，当前为 {}",
                MAX_POW_DIFFICULTY, self.signing.pow_difficulty
            )));
        }
        if self.signing.pow_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "signing.pow_max_attempts 必须大于 0".to_string(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs 必须大于 0".to_string(),
            ));
        }
        if self.stream.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "stream.buffer_size 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP 服务配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 调用方访问密钥，不设置时不做校验
    pub access_key: Option<String>,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            access_key: None,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 凭证池配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub session_tokens: Vec<String>,
    pub strategy: StrategyKind,
}

/// 签名配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// 设备指纹，不设置时启动时随机生成
    pub fingerprint: Option<String>,
    pub pow_difficulty: u32,
    pub pow_max_attempts: u64,
    pub pow_retry_limit: u32,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            fingerprint: None,
            pow_difficulty: DEFAULT_DIFFICULTY,
            pow_max_attempts: DEFAULT_MAX_ATTEMPTS,
            pow_retry_limit: DEFAULT_POW_RETRY_LIMIT,
        }
    }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub salt: String,
    pub refresh_policy: RefreshPolicyKind,
    /// `if_stale` 策略下签名的有效期
    pub stale_after_secs: u64,
    /// 空闲多久后清理会话
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            salt: DEFAULT_SESSION_SALT.to_string(),
            refresh_policy: RefreshPolicyKind::default(),
            stale_after_secs: 60,
            idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh_policy
            .with_stale_after(Duration::from_secs(self.stale_after_secs))
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别，`RUST_LOG` 优先
    pub level: String,
    /// 输出 JSON 格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
