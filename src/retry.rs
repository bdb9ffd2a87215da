//! 重试策略：(失败次数, 错误类别) → 重试延迟 / 放弃
//!
//! 纯函数，无副作用；抖动由调用方以 [`RetryContext::jitter`] 传入（0..1 的采样值）。

use std::time::Duration;

use serde::Serialize;

/// 外部错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 网络抖动、超时等，可指数退避重试
    Transient,
    /// 配额/限流，延迟至少到配额窗口重置
    RateLimited,
    /// 输入非法等，立即放弃
    Permanent,
}

/// 决策所需的外部上下文
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryContext {
    /// 距离外部配额窗口重置的时长（限流错误的延迟下限）
    pub until_window_reset: Option<Duration>,
    /// 抖动采样，取值 [0, 1)
    pub jitter: f64,
}

/// 策略给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

impl RetryDecision {
    pub fn is_abandon(&self) -> bool {
        matches!(self, RetryDecision::Abandon)
    }
}

/// 有界指数退避
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(3600), 3)
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// attempt 为已失败次数（第一次失败后为 1）
    pub fn decide(&self, attempt: u32, class: ErrorClass, ctx: RetryContext) -> RetryDecision {
        if class == ErrorClass::Permanent || attempt > self.max_attempts {
            return RetryDecision::Abandon;
        }

        let backoff = self.backoff(attempt);
        let delay = match class {
            ErrorClass::Transient => {
                let jitter = if ctx.jitter.is_finite() { ctx.jitter.clamp(0.0, 1.0) } else { 0.0 };
                backoff + backoff.mul_f64(self.jitter_ratio * jitter)
            }
            ErrorClass::RateLimited => backoff.max(ctx.until_window_reset.unwrap_or_default()),
            ErrorClass::Permanent => return RetryDecision::Abandon,
        };
        RetryDecision::Retry { delay }
    }

    /// base * 2^(attempt-1)，上限 max_delay
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}
