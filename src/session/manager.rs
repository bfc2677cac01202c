//! 会话管理
//!
//! 每个逻辑会话一把 `tokio::sync::Mutex`，刷新签名和使用签名在同一把锁内完成，
//! 不同会话互不阻塞。空闲会话由后台任务定期清理。

use super::signature::{SessionSigner, SignatureContext};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// 会话签名刷新策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// 每次出站请求前都重新签名
    EveryCall,
    /// 签名超过给定时长才重新生成
    IfStale(Duration),
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy::EveryCall
    }
}

/// 配置中的刷新策略名
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicyKind {
    #[default]
    EveryCall,
    IfStale,
}

impl RefreshPolicyKind {
    pub fn with_stale_after(self, stale_after: Duration) -> RefreshPolicy {
        match self {
            RefreshPolicyKind::EveryCall => RefreshPolicy::EveryCall,
            RefreshPolicyKind::IfStale => RefreshPolicy::IfStale(stale_after),
        }
    }
}

/// 单个逻辑会话的状态
#[derive(Debug)]
pub struct UpstreamSession {
    conversation_id: String,
    last_signature: Option<SignatureContext>,
    /// 上游在元数据行里返回的助手消息 id，按出现顺序
    assistant_message_ids: Vec<String>,
    refresh_count: u32,
    force_refresh: bool,
    last_used: Instant,
}

impl UpstreamSession {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            last_signature: None,
            assistant_message_ids: Vec::new(),
            refresh_count: 0,
            force_refresh: false,
            last_used: Instant::now(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn last_signature(&self) -> Option<&SignatureContext> {
        self.last_signature.as_ref()
    }

    /// 累计刷新次数
    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }

    pub fn assistant_message_ids(&self) -> &[String] {
        &self.assistant_message_ids
    }

    /// 确保签名可用
    ///
    /// 首次使用、被标记失效或按策略已过期时重新生成。
    pub fn ensure_fresh(
        &mut self,
        signer: &SessionSigner,
        policy: RefreshPolicy,
        now_millis: i64,
    ) -> SignatureContext {
        self.last_used = Instant::now();

        let needs_refresh = match (&self.last_signature, policy) {
            (None, _) => true,
            _ if self.force_refresh => true,
            (Some(_), RefreshPolicy::EveryCall) => true,
            (Some(ctx), RefreshPolicy::IfStale(max_age)) => {
                now_millis.saturating_sub(ctx.issued_at_millis) >= max_age.as_millis() as i64
            }
        };

        if let (false, Some(ctx)) = (needs_refresh, &self.last_signature) {
            return ctx.clone();
        }

        let ctx = signer.sign(&self.conversation_id, now_millis);
        self.refresh_count += 1;
        self.force_refresh = false;
        debug!(
            conversation_id = %self.conversation_id,
            refresh_count = self.refresh_count,
            "[SESSION] 会话签名已刷新"
        );
        self.last_signature = Some(ctx.clone());
        ctx
    }

    /// 标记当前签名失效（上游拒绝认证后调用），下次 ensure_fresh 必定重签
    pub fn invalidate(&mut self) {
        self.force_refresh = true;
    }

    pub fn record_message_id(&mut self, message_id: impl Into<String>) {
        self.assistant_message_ids.push(message_id.into());
        self.last_used = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// 会话表
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<UpstreamSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话的独占锁，会话不存在时创建
    ///
    /// 持有返回的 guard 期间，同一会话的其他调用会等待。
    pub async fn lock(&self, conversation_id: &str) -> OwnedMutexGuard<UpstreamSession> {
        let session = self
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UpstreamSession::new(conversation_id))))
            .clone();
        session.lock_owned().await
    }

    /// 记录上游返回的助手消息 id
    pub async fn record_message_id(&self, conversation_id: &str, message_id: &str) {
        let mut session = self.lock(conversation_id).await;
        session.record_message_id(message_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.sessions.contains_key(conversation_id)
    }

    /// 清理空闲超过 `max_idle` 的会话，返回清理数量
    ///
    /// 正在使用或有调用在排队等待的会话不会被清理。
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            match session.try_lock() {
                Ok(guard) => guard.idle_for() < max_idle,
                Err(_) => true,
            }
        });
        before.saturating_sub(self.sessions.len())
    }

    /// 启动后台清理任务，管理器被释放后任务自动退出
    pub fn spawn_sweeper(self: &Arc<Self>, max_idle: Duration, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        info!(
            "[SESSION] 启动空闲会话清理任务: idle_ttl={:?}, interval={:?}",
            max_idle, interval
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let evicted = manager.evict_idle(max_idle);
                if evicted > 0 {
                    debug!("[SESSION] 清理 {} 个空闲会话，剩余 {}", evicted, manager.len());
                }
            }
        })
    }
}
