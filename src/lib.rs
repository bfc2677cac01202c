//! relaycast
//!
//! 把带签名、带 PoW 的厂商私有聊天流转换成 OpenAI 兼容的流式/非流式响应。

pub mod config;
pub mod credential;
pub mod models;
pub mod providers;
pub mod server;
pub mod services;
pub mod session;
pub mod signing;
pub mod streaming;
pub mod telemetry;
