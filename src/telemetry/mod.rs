//! 日志初始化与脱敏

mod sanitizer;

pub use sanitizer::{mask_secret, sanitize};

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 优先于配置中的级别。重复调用时忽略（测试中常见）。
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber 已初始化，跳过");
    }
}
