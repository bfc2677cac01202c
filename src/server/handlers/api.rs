//! OpenAI 兼容接口

use crate::models::openai::ChatCompletionRequest;
use crate::providers::ProviderError;
use crate::server::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use std::convert::Infallible;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 选择逻辑会话的请求头
pub const CONVERSATION_HEADER: &str = "x-conversation-id";

// ============================================================================
// API Key 验证
// ============================================================================

/// 校验调用方密钥（`Authorization: Bearer` 或 `x-api-key`），常量时间比较
pub fn verify_api_key(
    headers: &HeaderMap,
    expected_key: &str,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok());

    let key = match auth {
        Some(s) => s.strip_prefix("Bearer ").unwrap_or(s).trim(),
        None => return Err(unauthorized("No API key provided")),
    };

    if !bool::from(key.as_bytes().ct_eq(expected_key.as_bytes())) {
        return Err(unauthorized("Invalid API key"));
    }
    Ok(())
}

fn unauthorized(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": {
                "type": "invalid_api_key",
                "message": message,
                "retryable": false,
            }
        })),
    )
}

/// ProviderError → 结构化错误响应
pub fn error_response(err: &ProviderError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_error_body())).into_response()
}

// ============================================================================
// /v1/chat/completions
// ============================================================================

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = state.access_key.as_deref() {
        if let Err(e) = verify_api_key(&headers, expected) {
            warn!("[SERVER] 拒绝未授权的 /v1/chat/completions 请求");
            return e.into_response();
        }
    }

    // 鉴权之后再解析请求体，解析失败同样返回结构化错误
    let mut request = match parse_request(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!("[SERVER] 请求体无效: {}", err);
            return error_response(&err);
        }
    };

    if request.conversation_id.is_none() {
        request.conversation_id = headers
            .get(CONVERSATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    info!(
        "[SERVER] POST /v1/chat/completions model={} stream={} messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    if !request.stream {
        return match state.adapter.chat_completion(&request).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => error_response(&err),
        };
    }

    // 响应体被丢弃（客户端断开）时 guard 触发取消，停止读取上游
    let cancel = CancellationToken::new();
    let frames = match state
        .adapter
        .chat_stream(&request, Some(cancel.clone()))
        .await
    {
        Ok(frames) => frames,
        Err(err) => return error_response(&err),
    };

    let guard = cancel.drop_guard();
    let body_stream = frames.map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(Bytes::from(frame))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|e| {
            error_response(&ProviderError::Unknown(format!(
                "Failed to build streaming response: {}",
                e
            )))
        })
}

fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest, ProviderError> {
    let request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| ProviderError::RequestError(format!("Invalid request body: {}", e)))?;
    if request.messages.is_empty() {
        return Err(ProviderError::RequestError(
            "messages must not be empty".to_string(),
        ));
    }
    Ok(request)
}
