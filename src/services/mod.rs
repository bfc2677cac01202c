//! 业务服务层

pub mod adapter_service;

pub use adapter_service::AdapterService;
