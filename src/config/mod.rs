//! 配置管理模块
//!
//! YAML 配置文件加载，缺省值和环境变量兜底。

mod path_utils;
mod types;
mod yaml;

pub use path_utils::{app_config_dir, collapse_tilde, expand_tilde};
pub use types::{
    Config, CredentialsConfig, LoggingConfig, ServerConfig, SessionConfig, SigningConfig,
    MAX_POW_DIFFICULTY,
};
pub use yaml::{
    load_config, load_config_from, parse_yaml, resolve_config_path, ConfigError, CONFIG_ENV,
    SESSION_TOKEN_ENV,
};
