//! 凭证池
//!
//! 初始化后只读，不会因为请求失败而剔除凭证；
//! 针对某个凭证的重试由调用方决定。

use super::strategy::{SelectionStrategy, StrategyKind};
use super::types::Credential;
use crate::providers::ProviderError;
use std::sync::Arc;
use tracing::{debug, info};

pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
    strategy: Box<dyn SelectionStrategy>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, strategy: Box<dyn SelectionStrategy>) -> Self {
        info!(
            "[POOL] 加载 {} 个凭证, 选择策略: {}",
            credentials.len(),
            strategy.id()
        );
        Self {
            credentials: credentials.into_iter().map(Arc::new).collect(),
            strategy,
        }
    }

    /// 从 token 列表构建，跳过空白项
    pub fn from_tokens<I, S>(tokens: I, kind: StrategyKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let credentials = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(id, secret)| Credential::new(id, secret))
            .collect();
        Self::new(credentials, kind.build())
    }

    /// 选出一个凭证；池为空时返回 `NoCredentialsAvailable`
    pub fn acquire(&self) -> Result<Arc<Credential>, ProviderError> {
        if self.credentials.is_empty() {
            return Err(ProviderError::NoCredentialsAvailable);
        }
        let idx = self.strategy.select(self.credentials.len()) % self.credentials.len();
        let credential = Arc::clone(&self.credentials[idx]);
        debug!("[POOL] 选中凭证 #{} ({})", credential.id(), credential.masked());
        Ok(credential)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn strategy_id(&self) -> &str {
        self.strategy.id()
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.credentials.len())
            .field("strategy", &self.strategy.id())
            .finish()
    }
}
