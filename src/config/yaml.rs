//! YAML 配置加载
//!
//! 查找顺序：显式路径 → `RELAYCAST_CONFIG` → `./config.yaml` → `~/.relaycast/config.yaml`。
//! 都不存在时使用默认配置。凭证池为空时读取 `RELAYCAST_SESSION_TOKEN`。

use super::path_utils::{app_config_dir, collapse_tilde, expand_tilde};
use super::types::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// 指定配置文件路径的环境变量
pub const CONFIG_ENV: &str = "RELAYCAST_CONFIG";
/// 单个 session token 的环境变量
pub const SESSION_TOKEN_ENV: &str = "RELAYCAST_SESSION_TOKEN";
/// 默认配置文件名
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件不存在: {}", .0.display())]
    NotFound(PathBuf),

    #[error("解析 YAML 失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 解析 YAML 字符串
pub fn parse_yaml(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// 确定要加载的配置文件
///
/// 显式路径和环境变量指定的路径必须存在；默认位置不存在时返回 `None`。
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_path: Option<String>,
) -> Result<Option<PathBuf>, ConfigError> {
    let required = explicit
        .map(expand_tilde)
        .or_else(|| env_path.filter(|p| !p.trim().is_empty()).map(expand_tilde));
    if let Some(path) = required {
        return if path.is_file() {
            Ok(Some(path))
        } else {
            Err(ConfigError::NotFound(path))
        };
    }

    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = app_config_dir() {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    Ok(candidates.into_iter().find(|p| p.is_file()))
}

/// 从指定文件（或默认配置）加载，补充环境变量中的 token 并校验
pub fn load_config_from(
    path: Option<&Path>,
    env_token: Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config = parse_yaml(&content)?;
            info!("[CONFIG] 已加载配置文件 {}", collapse_tilde(path));
            config
        }
        None => {
            info!("[CONFIG] 未找到配置文件，使用默认配置");
            Config::default()
        }
    };

    apply_token_fallback(&mut config, env_token);
    config.validate()?;

    if config.credentials.session_tokens.is_empty() {
        warn!(
            "[CONFIG] 没有配置 session token，请求将返回 no_credentials_available（可设置 {}）",
            SESSION_TOKEN_ENV
        );
    }
    Ok(config)
}

/// 按默认顺序查找并加载配置
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = resolve_config_path(explicit, std::env::var(CONFIG_ENV).ok())?;
    load_config_from(path.as_deref(), std::env::var(SESSION_TOKEN_ENV).ok())
}

fn apply_token_fallback(config: &mut Config, env_token: Option<String>) {
    let has_tokens = config
        .credentials
        .session_tokens
        .iter()
        .any(|t| !t.trim().is_empty());
    if has_tokens {
        return;
    }
    if let Some(token) = env_token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        info!("[CONFIG] 使用环境变量 {} 中的 session token", SESSION_TOKEN_ENV);
        config.credentials.session_tokens = vec![token];
    }
}
