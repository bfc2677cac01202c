//! 凭证池模块

pub mod pool;
pub mod strategy;
pub mod types;

pub use pool::CredentialPool;
pub use strategy::{RandomStrategy, RoundRobinStrategy, SelectionStrategy, StrategyKind};
pub use types::Credential;
