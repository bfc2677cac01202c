//! 端到端测试
//!
//! 在本地起一个模拟厂商服务，校验签名、PoW 与会话签名，
//! 再通过 relaycast 的 HTTP 接口走完整的流式/非流式调用。

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use relaycast_lib::config::Config;
use relaycast_lib::providers::HttpTransport;
use relaycast_lib::server::{build_router, AppState};
use relaycast_lib::services::AdapterService;
use relaycast_lib::session::SessionSigner;
use relaycast_lib::signing::pow::verify;
use relaycast_lib::signing::signer::{compute_signature, SignatureInput};
use relaycast_lib::signing::SigningKeyMaterial;
use relaycast_lib::streaming::extract_content_from_sse;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const SESSION_TOKEN: &str = "session-token-e2e";
const ACCESS_KEY: &str = "relay-key";
const FINGERPRINT: &str = "fp-e2e";

const VENDOR_BODY: &str = concat!(
    "f:{\"messageId\":\"msg-e2e\"}\n",
    "g:\"let me \\nthink\"\n",
    "g:\" harder\"\n",
    "0:\"The answer\"\n",
    "0:\" is 42.\"\n",
    "e:{\"finishReason\":\"stop\"}\n",
);

// ============================================================================
// 模拟厂商
// ============================================================================

#[derive(Default)]
struct MockVendor {
    /// 前 N 次请求返回 401
    reject_first: usize,
    calls: AtomicUsize,
    bodies: Mutex<Vec<serde_json::Value>>,
    failures: Mutex<Vec<String>>,
}

impl MockVendor {
    fn check(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), String> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| format!("missing header {}", name))
        };

        let cookie = get("cookie")?;
        if cookie != format!("__Secure-next-auth.session-token={}", SESSION_TOKEN) {
            return Err(format!("unexpected cookie {}", cookie));
        }

        let challenge = get("x-pow-challenge")?;
        let solution = get("x-pow-solution")?;
        if !verify(challenge, solution, 2) {
            return Err("invalid PoW solution".to_string());
        }

        let timestamp: i64 = get("x-timestamp")?
            .parse()
            .map_err(|_| "bad timestamp".to_string())?;
        let input = SignatureInput {
            method: "POST",
            path: "/api/chat",
            timestamp,
            nonce: get("x-nonce")?,
            fingerprint: get("x-fingerprint")?,
            solution,
            body,
        };
        let expected = compute_signature(&SigningKeyMaterial::derive(), &input)
            .map_err(|e| e.to_string())?;
        if get("x-signature")? != expected {
            return Err("signature mismatch".to_string());
        }

        let parsed: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| e.to_string())?;
        let conversation_id = parsed["id"].as_str().ok_or("missing body id")?;
        let current_time: i64 = get("currentTime")?
            .parse()
            .map_err(|_| "bad currentTime".to_string())?;
        let session = SessionSigner::default().sign(conversation_id, current_time);
        if get("sign")? != session.signature {
            return Err("session signature mismatch".to_string());
        }

        self.bodies.lock().push(parsed);
        Ok(())
    }
}

async fn vendor_chat(
    State(vendor): State<Arc<MockVendor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = vendor.calls.fetch_add(1, Ordering::SeqCst);
    if let Err(reason) = vendor.check(&headers, &body) {
        vendor.failures.lock().push(reason.clone());
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }
    if call < vendor.reject_first {
        return (StatusCode::UNAUTHORIZED, "session expired").into_response();
    }

    // 分成多个 chunk 发送，行会被切断
    let (head, tail) = VENDOR_BODY.split_at(17);
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(head.as_bytes())),
        Ok(Bytes::from_static(tail.as_bytes())),
    ];
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

// ============================================================================
// 测试上下文
// ============================================================================

struct E2EContext {
    vendor: Arc<MockVendor>,
    relay: SocketAddr,
    client: reqwest::Client,
}

impl E2EContext {
    async fn new(reject_first: usize) -> Self {
        let vendor = Arc::new(MockVendor {
            reject_first,
            ..Default::default()
        });
        let vendor_addr = spawn(
            Router::new()
                .route("/api/chat", post(vendor_chat))
                .with_state(vendor.clone()),
        )
        .await;

        let mut config = Config::default();
        config.vendor.base_url = format!("http://{}", vendor_addr);
        config.credentials.session_tokens = vec![SESSION_TOKEN.to_string()];
        config.signing.fingerprint = Some(FINGERPRINT.to_string());
        config.server.access_key = Some(ACCESS_KEY.to_string());

        let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
        let adapter = Arc::new(AdapterService::from_config(&config, transport).unwrap());
        let state = AppState::new(adapter, config.server.access_key.clone());
        let relay = spawn(build_router(state, config.server.max_body_bytes)).await;

        Self {
            vendor,
            relay,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("http://{}/v1/chat/completions", self.relay))
            .bearer_auth(ACCESS_KEY)
            .header("X-Conversation-Id", "conv-e2e")
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    fn assert_no_vendor_failures(&self) {
        let failures = self.vendor.failures.lock();
        assert!(failures.is_empty(), "vendor rejected request: {:?}", failures);
    }
}

fn chat_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "gpt-4.1",
        "stream": stream,
        "messages": [{"role": "user", "content": "what is the answer?"}]
    })
}

fn sse_frames(text: &str) -> Vec<String> {
    text.split_inclusive("\n\n").map(str::to_string).collect()
}

// ============================================================================
// 测试
// ============================================================================

#[tokio::test]
async fn test_streaming_end_to_end() {
    let ctx = E2EContext::new(0).await;
    let response = ctx.post(chat_body(true)).await;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let text = response.text().await.unwrap();
    ctx.assert_no_vendor_failures();

    let frames = sse_frames(&text);
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
    assert_eq!(
        extract_content_from_sse(&frames),
        "<think>\n\nlet me \nthink harder\n</think>\n\nThe answer is 42."
    );

    let first: serde_json::Value =
        serde_json::from_str(frames[0].trim().trim_start_matches("data: ")).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], "gpt-4.1");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

    // 倒数第二帧是 finish：空 delta + stop
    let finish: serde_json::Value = serde_json::from_str(
        frames[frames.len() - 2]
            .trim()
            .trim_start_matches("data: "),
    )
    .unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));

    assert!(text.contains("\"thinking_content\":\"let me \\nthink harder\""));
}

#[tokio::test]
async fn test_non_streaming_end_to_end() {
    let ctx = E2EContext::new(0).await;
    let response = ctx.post(chat_body(false)).await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    ctx.assert_no_vendor_failures();

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "The answer is 42.");
    assert_eq!(
        body["choices"][0]["message"]["reasoning_content"],
        "let me \nthink harder"
    );
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() > 0);

    let bodies = ctx.vendor.bodies.lock();
    assert_eq!(bodies[0]["id"], "conv-e2e");
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["messages"][0]["parts"][0]["text"], "what is the answer?");
}

#[tokio::test]
async fn test_auth_rejected_once_is_retried() {
    let ctx = E2EContext::new(1).await;
    let response = ctx.post(chat_body(false)).await;

    assert_eq!(response.status(), 200);
    ctx.assert_no_vendor_failures();
    assert_eq!(ctx.vendor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_rejected_twice_is_terminal() {
    let ctx = E2EContext::new(5).await;
    let response = ctx.post(chat_body(true)).await;

    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_rejected");
    assert_eq!(body["error"]["retryable"], false);
    ctx.assert_no_vendor_failures();
    assert_eq!(ctx.vendor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_access_key_required() {
    let ctx = E2EContext::new(0).await;
    let response = ctx
        .client
        .post(format!("http://{}/v1/chat/completions", ctx.relay))
        .bearer_auth("wrong-key")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(ctx.vendor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_message_id_reused_in_next_turn() {
    let ctx = E2EContext::new(0).await;
    assert_eq!(ctx.post(chat_body(false)).await.status(), 200);

    let follow_up = serde_json::json!({
        "model": "gpt-4.1",
        "messages": [
            {"role": "user", "content": "what is the answer?"},
            {"role": "assistant", "content": "The answer is 42."},
            {"role": "user", "content": "why?"}
        ]
    });
    assert_eq!(ctx.post(follow_up).await.status(), 200);
    ctx.assert_no_vendor_failures();

    let bodies = ctx.vendor.bodies.lock();
    assert_eq!(bodies[1]["messages"][1]["id"], "msg-e2e");
}

#[tokio::test]
async fn test_silent_vendor_times_out() {
    // 接受连接但从不写响应
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let vendor_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let mut config = Config::default();
    config.vendor.base_url = format!("http://{}", vendor_addr);
    config.credentials.session_tokens = vec![SESSION_TOKEN.to_string()];
    config.stream.timeout_ms = 300;
    config.stream.chunk_timeout_ms = 300;

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
    let adapter = AdapterService::from_config(&config, transport).unwrap();
    let request: relaycast_lib::models::openai::ChatCompletionRequest =
        serde_json::from_value(chat_body(false)).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(3), adapter.chat_completion(&request))
        .await
        .expect("adapter should give up before the outer deadline")
        .unwrap_err();
    assert_eq!(err.error_type(), "upstream_timeout");
    assert_eq!(err.http_status(), 504);
}
