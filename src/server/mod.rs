//! HTTP 服务
//!
//! 只暴露 `POST /v1/chat/completions`，鉴权后交给 AdapterService。

pub mod handlers;

use crate::services::AdapterService;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// 服务共享状态
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<AdapterService>,
    /// 调用方访问密钥，`None` 时不校验
    pub access_key: Option<String>,
}

impl AppState {
    pub fn new(adapter: Arc<AdapterService>, access_key: Option<String>) -> Self {
        let access_key = access_key.filter(|k| !k.trim().is_empty());
        Self {
            adapter,
            access_key,
        }
    }
}

/// 构建路由
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::api::chat_completions))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}
