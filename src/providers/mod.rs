//! 上游厂商接入
//!
//! - `error`: 统一错误类型
//! - `vendor`: 厂商描述与请求体构造
//! - `transport`: HTTP 调用

pub mod error;
pub mod transport;
pub mod vendor;

pub use error::ProviderError;
pub use transport::{HttpTransport, UpstreamRequest, VendorTransport};
pub use vendor::{CredentialAttachment, VendorProfile, WebSearchToggle};
