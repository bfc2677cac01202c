//! 凭证类型

use crate::telemetry::mask_secret;
use std::fmt;

/// 上游账号的 session token
///
/// 加载后不可变，由 CredentialPool 独占持有。
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// 池内序号，仅用于日志
    id: usize,
    secret: String,
}

impl Credential {
    pub fn new(id: usize, secret: impl Into<String>) -> Self {
        Self {
            id,
            secret: secret.into(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// 原始 token，只在附加到上游请求时使用
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// 脱敏后的 token
    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &self.masked())
            .finish()
    }
}
