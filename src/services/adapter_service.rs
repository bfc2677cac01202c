//! 适配服务
//!
//! 单次调用的流程：取凭证 → 刷新会话签名 → 构造请求体 → 签名 → 发送 → 翻译/聚合。
//! 上游拒绝认证时强制刷新会话并重试一次，第二次仍被拒绝则直接返回；
//! 传输类错误不刷新会话，交给调用方决定是否重试。

use crate::config::Config;
use crate::credential::CredentialPool;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::providers::{ProviderError, UpstreamRequest, VendorProfile, VendorTransport};
use crate::session::{RefreshPolicy, SessionManager, SessionSigner};
use crate::signing::{DeviceFingerprint, ProofOfWorkSolver, RequestSigner, SigningKeyMaterial};
use crate::streaming::converter::new_response_id;
use crate::streaming::{
    aggregate, into_sse_stream, translate, ChunkRenderer, MetadataCallback, StreamConfig,
    StreamResponse,
};
use crate::telemetry::mask_secret;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 认证失败后最多刷新重试的次数
const AUTH_RETRY_LIMIT: u32 = 1;

/// 适配服务
pub struct AdapterService {
    pool: Arc<CredentialPool>,
    sessions: Arc<SessionManager>,
    session_signer: SessionSigner,
    refresh_policy: RefreshPolicy,
    signer: RequestSigner,
    vendor: Arc<VendorProfile>,
    transport: Arc<dyn VendorTransport>,
    stream_config: StreamConfig,
}

impl AdapterService {
    pub fn new(
        pool: Arc<CredentialPool>,
        signer: RequestSigner,
        vendor: Arc<VendorProfile>,
        transport: Arc<dyn VendorTransport>,
    ) -> Self {
        Self {
            pool,
            sessions: Arc::new(SessionManager::new()),
            session_signer: SessionSigner::default(),
            refresh_policy: RefreshPolicy::default(),
            signer,
            vendor,
            transport,
            stream_config: StreamConfig::default(),
        }
    }

    /// 按配置装配：密钥和指纹在这里构造一次，之后只读共享
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn VendorTransport>,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|e| ProviderError::ConfigurationError(e.to_string()))?;

        let fingerprint = DeviceFingerprint::from_config(config.signing.fingerprint.as_deref());
        info!(
            "[ADAPTER] 厂商 {} ({}), 设备指纹 {}",
            config.vendor.name,
            config.vendor.url(),
            mask_secret(fingerprint.as_str())
        );

        let signer = RequestSigner::new(
            Arc::new(SigningKeyMaterial::derive()),
            Arc::new(fingerprint),
            ProofOfWorkSolver::new(config.signing.pow_max_attempts),
        )
        .with_difficulty(config.signing.pow_difficulty)
        .with_pow_retry_limit(config.signing.pow_retry_limit);

        let pool = CredentialPool::from_tokens(
            &config.credentials.session_tokens,
            config.credentials.strategy,
        );
        info!(
            "[ADAPTER] 凭证池: {} 个 token, 策略 {}",
            pool.len(),
            pool.strategy_id()
        );

        Ok(Self::new(
            Arc::new(pool),
            signer,
            Arc::new(config.vendor.clone()),
            transport,
        )
        .with_session_signer(SessionSigner::new(config.session.salt.clone()))
        .with_refresh_policy(config.session.refresh_policy())
        .with_stream_config(config.stream.clone()))
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_session_signer(mut self, session_signer: SessionSigner) -> Self {
        self.session_signer = session_signer;
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn vendor(&self) -> &VendorProfile {
        &self.vendor
    }

    /// 请求中的会话 id，缺省时生成新的
    pub fn resolve_conversation_id(request: &ChatCompletionRequest) -> String {
        request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// 建立上游流
    ///
    /// 会话锁从刷新签名一直持有到请求发出，同一会话的并发调用依次进行。
    pub async fn open_upstream(
        &self,
        request: &ChatCompletionRequest,
        conversation_id: &str,
    ) -> Result<StreamResponse, ProviderError> {
        let credential = self.pool.acquire()?;
        let mut session = self.sessions.lock(conversation_id).await;
        let mut auth_retries = 0;

        loop {
            let now_millis = chrono::Utc::now().timestamp_millis();
            let context = session.ensure_fresh(&self.session_signer, self.refresh_policy, now_millis);

            let body = self.vendor.build_body(
                request,
                conversation_id,
                session.assistant_message_ids(),
            )?;
            let path = self.vendor.request_path();
            let signed = self
                .signer
                .sign("POST", &path, body.clone())
                .await?;

            let mut headers = self.vendor.static_headers();
            headers.extend(
                signed
                    .header_pairs()
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string())),
            );
            headers.push(self.vendor.credential.header(credential.secret()));
            if self.vendor.session_signature {
                headers.extend(
                    context
                        .header_pairs()
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), value)),
                );
            }

            let upstream = UpstreamRequest {
                method: "POST".to_string(),
                url: self.vendor.url(),
                path,
                headers,
                body,
            };

            debug!(
                conversation_id = %conversation_id,
                credential = %credential.masked(),
                "[ADAPTER] 发送上游请求"
            );

            // 响应头也受空闲超时约束，避免持锁无限等待
            let dispatched = tokio::time::timeout(
                self.stream_config.chunk_timeout_duration(),
                self.transport.dispatch(upstream),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::UpstreamTransportError {
                    message: format!(
                        "等待上游响应超时 ({}ms)",
                        self.stream_config.chunk_timeout_ms
                    ),
                    timeout: true,
                })
            });

            match dispatched {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_auth_failure() && auth_retries < AUTH_RETRY_LIMIT => {
                    auth_retries += 1;
                    warn!(
                        conversation_id = %conversation_id,
                        "[ADAPTER] 上游拒绝认证，刷新会话后重试: {}",
                        err
                    );
                    session.invalidate();
                }
                Err(err) => {
                    warn!(
                        conversation_id = %conversation_id,
                        error_type = err.error_type(),
                        "[ADAPTER] 上游调用失败: {}",
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    /// 流式调用，返回 SSE 帧流
    ///
    /// `cancel` 被触发时立即停止读取上游并释放连接。
    pub async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<BoxStream<'static, String>, ProviderError> {
        let conversation_id = Self::resolve_conversation_id(request);
        let source = self.open_upstream(request, &conversation_id).await?;

        let renderer = ChunkRenderer::new(request.model.clone());
        info!(
            conversation_id = %conversation_id,
            "[ADAPTER] 开始流式响应 {} (model={})",
            renderer.response_id(),
            request.model
        );

        let collected = Arc::new(Mutex::new(Vec::new()));
        let events = translate(source, self.vendor.tags.clone(), &self.stream_config, cancel)
            .with_label(renderer.response_id())
            .with_metadata_callback(message_id_collector(collected.clone()));

        // 流读完后把上游返回的消息 id 记到会话上
        let sessions = self.sessions.clone();
        let tail = futures::stream::once(async move {
            let ids: Vec<String> = std::mem::take(&mut *collected.lock());
            for id in ids {
                sessions.record_message_id(&conversation_id, &id).await;
            }
            None::<String>
        })
        .filter_map(futures::future::ready);

        Ok(into_sse_stream(events, renderer).chain(tail).boxed())
    }

    /// 非流式调用，聚合完整响应
    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let conversation_id = Self::resolve_conversation_id(request);
        let source = self.open_upstream(request, &conversation_id).await?;

        let collected = Arc::new(Mutex::new(Vec::new()));
        let events = translate(source, self.vendor.tags.clone(), &self.stream_config, None)
            .with_label(new_response_id())
            .with_metadata_callback(message_id_collector(collected.clone()));

        let prompt_text = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let response = aggregate(events, &request.model, &prompt_text).await?;

        let ids: Vec<String> = std::mem::take(&mut *collected.lock());
        for id in ids {
            self.sessions.record_message_id(&conversation_id, &id).await;
        }

        info!(
            conversation_id = %conversation_id,
            "[ADAPTER] 非流式响应完成 {} (completion_tokens={})",
            response.id,
            response.usage.completion_tokens
        );
        Ok(response)
    }
}

/// 收集元数据行中的 `messageId`
fn message_id_collector(sink: Arc<Mutex<Vec<String>>>) -> MetadataCallback {
    Box::new(move |value| {
        if let Some(id) = value.get("messageId").and_then(|v| v.as_str()) {
            sink.lock().push(id.to_string());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StrategyKind;
    use crate::models::openai::ChatMessage;
    use crate::streaming::extract_content_from_sse;
    use crate::streaming::stream_from_chunks;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Scripted = Result<Vec<&'static str>, ProviderError>;

    /// 按脚本依次返回结果，并记录收到的请求
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<UpstreamRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl VendorTransport for ScriptedTransport {
        async fn dispatch(
            &self,
            request: UpstreamRequest,
        ) -> Result<StreamResponse, ProviderError> {
            self.requests.lock().push(request);
            match self.script.lock().pop_front() {
                Some(Ok(chunks)) => Ok(stream_from_chunks(chunks)),
                Some(Err(err)) => Err(err),
                None => Err(ProviderError::Unknown("script exhausted".to_string())),
            }
        }
    }

    fn rejected() -> Scripted {
        Err(ProviderError::AuthenticationRejected("HTTP 401".to_string()))
    }

    const ANSWER: &[&str] = &[
        "f:{\"messageId\":\"msg-1\"}\n",
        "g:\"think\"\n0:\"hi\"\n",
        "0:\" there\"\ne:{}\n",
    ];

    fn service(transport: Arc<ScriptedTransport>, tokens: &[&str]) -> AdapterService {
        let signer = RequestSigner::new(
            Arc::new(SigningKeyMaterial::derive()),
            Arc::new(DeviceFingerprint::from_config(Some("fp-test"))),
            ProofOfWorkSolver::default(),
        )
        .with_difficulty(1);
        AdapterService::new(
            Arc::new(CredentialPool::from_tokens(tokens, StrategyKind::RoundRobin)),
            signer,
            Arc::new(VendorProfile::default()),
            transport,
        )
    }

    fn request(conversation_id: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4.1".to_string(),
            messages: vec![ChatMessage::new("user", "hello")],
            stream: false,
            temperature: None,
            max_tokens: None,
            conversation_id: Some(conversation_id.to_string()),
        }
    }

    async fn refresh_count(service: &AdapterService, id: &str) -> u32 {
        service.sessions().lock(id).await.refresh_count()
    }

    #[tokio::test]
    async fn test_completion_success() {
        let transport = ScriptedTransport::new(vec![Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &["token-a"]);

        let response = service.chat_completion(&request("c1")).await.unwrap();
        assert_eq!(response.choices[0].message.content, "hi there");
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("think")
        );
        assert_eq!(response.model, "gpt-4.1");
        assert_eq!(transport.request_count(), 1);

        let session = service.sessions().lock("c1").await;
        assert_eq!(session.assistant_message_ids(), ["msg-1".to_string()]);
    }

    #[tokio::test]
    async fn test_signed_headers_attached() {
        let transport = ScriptedTransport::new(vec![Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &["token-a"]);
        service.chat_completion(&request("c1")).await.unwrap();

        let requests = transport.requests.lock();
        let sent = &requests[0];
        for name in [
            "X-Timestamp",
            "X-Nonce",
            "X-Signature",
            "X-Fingerprint",
            "X-PoW-Challenge",
            "X-PoW-Solution",
            "currentTime",
            "sign",
        ] {
            assert!(sent.header(name).is_some(), "missing header {}", name);
        }
        assert_eq!(sent.header("X-Fingerprint"), Some("fp-test"));
        assert_eq!(
            sent.header("Cookie"),
            Some("__Secure-next-auth.session-token=token-a")
        );
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.url, "https://megallm.io/api/chat");
        assert!(crate::signing::pow::verify(
            sent.header("X-PoW-Challenge").unwrap(),
            sent.header("X-PoW-Solution").unwrap(),
            1
        ));
    }

    #[tokio::test]
    async fn test_signature_covers_base_url_prefix() {
        let transport = ScriptedTransport::new(vec![Ok(ANSWER.to_vec())]);
        let mut vendor = VendorProfile::default();
        vendor.base_url = "https://gateway.example.com/proxy".to_string();
        let signer = RequestSigner::new(
            Arc::new(SigningKeyMaterial::derive()),
            Arc::new(DeviceFingerprint::from_config(Some("fp-test"))),
            ProofOfWorkSolver::default(),
        )
        .with_difficulty(1);
        let service = AdapterService::new(
            Arc::new(CredentialPool::from_tokens(&["token-a"], StrategyKind::RoundRobin)),
            signer,
            Arc::new(vendor),
            transport.clone(),
        );
        service.chat_completion(&request("c1")).await.unwrap();

        let requests = transport.requests.lock();
        let sent = &requests[0];
        assert_eq!(sent.url, "https://gateway.example.com/proxy/api/chat");
        assert_eq!(sent.path, "/proxy/api/chat");

        let input = crate::signing::signer::SignatureInput {
            method: "POST",
            path: "/proxy/api/chat",
            timestamp: sent.header("X-Timestamp").unwrap().parse().unwrap(),
            nonce: sent.header("X-Nonce").unwrap(),
            fingerprint: sent.header("X-Fingerprint").unwrap(),
            solution: sent.header("X-PoW-Solution").unwrap(),
            body: &sent.body,
        };
        let expected =
            crate::signing::signer::compute_signature(&SigningKeyMaterial::derive(), &input)
                .unwrap();
        assert_eq!(sent.header("X-Signature"), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_once_then_succeeds() {
        let transport = ScriptedTransport::new(vec![rejected(), Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &["token-a"]);

        let response = service.chat_completion(&request("c1")).await.unwrap();
        assert_eq!(response.choices[0].message.content, "hi there");
        assert_eq!(transport.request_count(), 2);
        assert_eq!(refresh_count(&service, "c1").await, 2);

        // 两次请求的签名各自独立生成
        let requests = transport.requests.lock();
        assert_ne!(
            requests[0].header("X-Nonce"),
            requests[1].header("X-Nonce")
        );
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_terminal() {
        let transport =
            ScriptedTransport::new(vec![rejected(), rejected(), Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &["token-a"]);

        let err = service.chat_completion(&request("c1")).await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(transport.request_count(), 2);
        assert_eq!(refresh_count(&service, "c1").await, 2);
    }

    #[tokio::test]
    async fn test_transport_error_does_not_refresh() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::UpstreamTransportError {
                message: "connection reset".to_string(),
                timeout: false,
            }),
            Ok(ANSWER.to_vec()),
        ]);
        let service = service(transport.clone(), &["token-a"]);

        let err = service.chat_completion(&request("c1")).await.unwrap_err();
        assert_eq!(err.error_type(), "upstream_transport_error");
        assert_eq!(transport.request_count(), 1);
        assert_eq!(refresh_count(&service, "c1").await, 1);
    }

    /// 接受请求但永远不返回响应头
    struct StalledTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VendorTransport for StalledTransport {
        async fn dispatch(
            &self,
            _request: UpstreamRequest,
        ) -> Result<StreamResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_dispatch_times_out_and_releases_session() {
        let transport = Arc::new(StalledTransport {
            calls: AtomicUsize::new(0),
        });
        let signer = RequestSigner::new(
            Arc::new(SigningKeyMaterial::derive()),
            Arc::new(DeviceFingerprint::from_config(Some("fp-test"))),
            ProofOfWorkSolver::default(),
        )
        .with_difficulty(1);
        let service = AdapterService::new(
            Arc::new(CredentialPool::from_tokens(&["token-a"], StrategyKind::RoundRobin)),
            signer,
            Arc::new(VendorProfile::default()),
            transport.clone(),
        )
        .with_stream_config(StreamConfig::default().with_chunk_timeout_ms(100));

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.chat_completion(&request("c1")),
        )
        .await
        .expect("dispatch should time out on its own")
        .unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(err.error_type(), "upstream_timeout");
        assert_eq!(err.http_status(), 504);
        // 超时不触发刷新重试
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresh_count(&service, "c1").await, 1);

        // 会话锁已释放，同一会话的下一次调用不会被阻塞
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.chat_completion(&request("c1")),
        )
        .await
        .expect("session lock should be released")
        .unwrap_err();
        assert_eq!(err.error_type(), "upstream_timeout");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let transport = ScriptedTransport::new(vec![Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &[]);

        let err = service.chat_completion(&request("c1")).await.unwrap_err();
        assert_eq!(err, ProviderError::NoCredentialsAvailable);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_frames_and_message_id_reuse() {
        let transport =
            ScriptedTransport::new(vec![Ok(ANSWER.to_vec()), Ok(ANSWER.to_vec())]);
        let service = service(transport.clone(), &["token-a"]);

        let frames: Vec<String> = service
            .chat_stream(&request("c1"), None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
        assert_eq!(
            extract_content_from_sse(&frames),
            "<think>\n\nthink\n</think>\n\nhi there"
        );

        // 下一轮的历史里带上助手消息，复用上游返回的 id
        let mut next = request("c1");
        next.messages.push(ChatMessage::new("assistant", "hi there"));
        next.messages.push(ChatMessage::new("user", "more"));
        service.chat_completion(&next).await.unwrap();

        let requests = transport.requests.lock();
        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(body["id"], "c1");
        assert_eq!(body["messages"][1]["id"], "msg-1");
    }

    #[tokio::test]
    async fn test_stream_upstream_error_surfaces_before_stream() {
        let transport = ScriptedTransport::new(vec![Err(ProviderError::ServerError(
            "HTTP 502".to_string(),
        ))]);
        let service = service(transport, &["token-a"]);
        let result = service.chat_stream(&request("c1"), None).await;
        assert!(matches!(result, Err(ProviderError::ServerError(_))));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.credentials.session_tokens = vec!["tok-a".to_string(), " ".to_string()];
        config.signing.fingerprint = Some("fp-config".to_string());
        let transport = ScriptedTransport::new(Vec::new());

        let service = AdapterService::from_config(&config, transport).unwrap();
        assert_eq!(service.pool.len(), 1);
        assert_eq!(service.signer.fingerprint().as_str(), "fp-config");
        assert_eq!(service.refresh_policy, RefreshPolicy::EveryCall);

        config.vendor.chat_path = "no-slash".to_string();
        let transport = ScriptedTransport::new(Vec::new());
        assert!(matches!(
            AdapterService::from_config(&config, transport),
            Err(ProviderError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_resolve_conversation_id() {
        assert_eq!(AdapterService::resolve_conversation_id(&request(" c9 ")), "c9");
        let mut blank = request("");
        blank.conversation_id = Some("  ".to_string());
        let generated = AdapterService::resolve_conversation_id(&blank);
        assert_eq!(generated.len(), 36);
    }
}
