//! 会话模块
//!
//! - `signature`: 会话级签名（md5 + 盐值）
//! - `manager`: 每会话状态、刷新策略、空闲清理

pub mod manager;
pub mod signature;

pub use manager::{RefreshPolicy, RefreshPolicyKind, SessionManager, UpstreamSession};
pub use signature::{SessionSigner, SignatureContext, DEFAULT_SESSION_SALT};
