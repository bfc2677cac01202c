//! PoW 求解器
//!
//! 找到最小的整数 nonce，使 `SHA256(challenge:nonce)` 的十六进制表示
//! 以 `difficulty` 个 `'0'` 开头。纯 CPU 计算，无 I/O，
//! 在异步上下文中必须放到 `spawn_blocking` 中执行。

use crate::providers::ProviderError;
use sha2::{Digest, Sha256};

/// 默认难度（上游前端固定使用 2）
pub const DEFAULT_DIFFICULTY: u32 = 2;

/// 默认尝试上限
pub const DEFAULT_MAX_ATTEMPTS: u64 = 1_000_000;

/// PoW 解
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowSolution {
    /// 找到的 nonce（十进制字符串，直接作为请求头的值）
    pub solution: String,
    /// 尝试次数
    pub attempts: u64,
}

/// PoW 求解器
#[derive(Debug, Clone, Copy)]
pub struct ProofOfWorkSolver {
    max_attempts: u64,
}

impl Default for ProofOfWorkSolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ProofOfWorkSolver {
    /// 创建带尝试上限的求解器
    pub fn new(max_attempts: u64) -> Self {
        Self { max_attempts }
    }

    /// 尝试上限
    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// 求解
    ///
    /// 从 0 开始递增 nonce，返回第一个满足前缀条件的解。
    /// 超过尝试上限返回 `PowExhausted`，调用方应重新生成 challenge 后重试。
    pub fn solve(&self, challenge: &str, difficulty: u32) -> Result<PowSolution, ProviderError> {
        let mut nonce: u64 = 0;
        while nonce < self.max_attempts {
            let digest = Sha256::digest(format!("{}:{}", challenge, nonce).as_bytes());
            if has_leading_zero_nibbles(&digest, difficulty) {
                return Ok(PowSolution {
                    solution: nonce.to_string(),
                    attempts: nonce + 1,
                });
            }
            nonce += 1;
        }

        Err(ProviderError::PowExhausted {
            attempts: self.max_attempts,
            difficulty,
        })
    }
}

/// 校验一个解是否满足难度
pub fn verify(challenge: &str, solution: &str, difficulty: u32) -> bool {
    let digest = Sha256::digest(format!("{}:{}", challenge, solution).as_bytes());
    has_leading_zero_nibbles(&digest, difficulty)
}

/// 十六进制表示以 `count` 个 '0' 开头，等价于前 `count` 个半字节为 0
fn has_leading_zero_nibbles(digest: &[u8], count: u32) -> bool {
    let count = count as usize;
    if count > digest.len() * 2 {
        return false;
    }
    let full_bytes = count / 2;
    if digest[..full_bytes].iter().any(|b| *b != 0) {
        return false;
    }
    count % 2 == 0 || digest[full_bytes] >> 4 == 0
}
