//! 路径工具
//!
//! `~` 展开与收缩，以及默认配置目录。

use std::path::{Path, PathBuf};

/// 配置目录名（位于用户主目录下）
pub const APP_DIR_NAME: &str = ".relaycast";

/// 展开开头的 `~` 为用户主目录
///
/// 只支持 `~` 与 `~/path`；`~user/path` 和无法获取主目录时原样返回。
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();

    let Some(home_dir) = dirs::home_dir() else {
        return path.to_path_buf();
    };

    if path_str == "~" {
        home_dir
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        home_dir.join(rest)
    } else {
        path.to_path_buf()
    }
}

/// 把主目录下的路径收缩为 `~/...`，用于日志展示
pub fn collapse_tilde<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();
    let Some(home_dir) = dirs::home_dir() else {
        return path.to_string_lossy().to_string();
    };

    match path.strip_prefix(&home_dir) {
        Ok(stripped) if stripped.as_os_str().is_empty() => "~".to_string(),
        Ok(stripped) => format!("~/{}", stripped.to_string_lossy()),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

/// 默认配置目录 `~/.relaycast`
pub fn app_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DIR_NAME))
}
