//! 凭证选择策略
//!
//! 池本身只负责持有凭证，选哪一个交给可替换的策略，
//! 测试时可以注入确定性的策略。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 选择策略
pub trait SelectionStrategy: Send + Sync {
    /// 策略标识
    fn id(&self) -> &str;

    /// 在 `[0, len)` 中选出一个下标，调用方保证 `len > 0`
    fn select(&self, len: usize) -> usize;
}

/// 均匀随机
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn id(&self) -> &str {
        "random"
    }

    fn select(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// 轮询
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    index: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn id(&self) -> &str {
        "round_robin"
    }

    fn select(&self, len: usize) -> usize {
        self.index.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// 配置中的策略名
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Random,
    RoundRobin,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::Random => Box::new(RandomStrategy),
            StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        }
    }
}
