use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::TransportError;

/// 重试判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// 纯函数：attempts 是本次失败之后的累计失败次数。
/// 延迟为 min(max_delay, base_delay * 2^attempts)。
pub fn decide(attempts: u32, base_delay: Duration, max_delay: Duration, max_attempts: u32) -> RetryDecision {
    if attempts >= max_attempts {
        return RetryDecision::GiveUp;
    }
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    let delay = base_delay.checked_mul(factor).unwrap_or(max_delay);
    RetryDecision::RetryAfter(delay.min(max_delay))
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// 不可重试的错误直接放弃
    pub fn decide(&self, attempts: u32, error: &TransportError) -> RetryDecision {
        if error.is_fatal() {
            return RetryDecision::GiveUp;
        }
        decide(attempts, self.base_delay, self.max_delay, self.max_attempts)
    }

    pub fn get_delay(&self, attempts: u32) -> Duration {
        match decide(attempts, self.base_delay, self.max_delay, u32::MAX) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::GiveUp => self.max_delay,
        }
    }
}
