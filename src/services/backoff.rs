//! 退避策略
//!
//! RateLimiter 与 ErrorIsolator 共用同一个参数化的退避对象，
//! 不再在各个调用点手写 `sleep(Duration::from_secs(2))` 的重试循环。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 指数退避 + 抖动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// 第一次退避的时长
    #[serde(with = "crate::config::serde_ms", rename = "base_ms")]
    pub base: Duration,
    /// 每次失败的放大倍数
    pub multiplier: f64,
    /// 上限
    #[serde(with = "crate::config::serde_ms", rename = "max_ms")]
    pub max: Duration,
    /// 抖动比例，0.2 表示在 [0.8, 1.2] 倍之间随机
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// 第 `retry` 次重试前的等待时长（从 1 开始），不含抖动
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// 第 `retry` 次重试前的等待时长，含抖动
    pub fn jittered_delay_for(&self, retry: u32) -> Duration {
        apply_jitter(self.delay_for(retry), self.jitter)
    }

    /// 在当前值上放大一次，不超过上限
    pub fn grow(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.base.min(self.max);
        }
        // 先在 f64 上截断到上限，避免乘积超出 Duration 的范围
        let secs = current.as_secs_f64() * self.multiplier.max(1.0);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max)
        }
    }

    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{}.multiplier", field),
                "必须是 >= 1.0 的有限数",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                format!("{}.jitter", field),
                "必须在 [0, 1] 之间",
            ));
        }
        if self.max < self.base {
            return Err(ConfigError::invalid(
                format!("{}.max_ms", field),
                "不能小于 base_ms",
            ));
        }
        Ok(())
    }
}

/// 在 `[1 - jitter, 1 + jitter]` 倍之间随机缩放
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(200), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1))
            .with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.jittered_delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_grow_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 3.0, Duration::from_millis(500));
        assert_eq!(policy.grow(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.grow(Duration::from_millis(100)), Duration::from_millis(300));
        assert_eq!(policy.grow(Duration::from_millis(300)), Duration::from_millis(500));
    }

    #[test]
    fn test_grow_with_huge_multiplier_hits_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(300), 1e20, Duration::from_secs(30));
        assert_eq!(policy.grow(Duration::from_millis(300)), Duration::from_secs(30));
        assert_eq!(policy.grow(Duration::from_secs(30)), Duration::from_secs(30));

        let unbounded = BackoffPolicy::new(Duration::from_secs(1), f64::INFINITY, Duration::MAX);
        assert_eq!(unbounded.grow(Duration::from_secs(1)), Duration::MAX);
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate("backoff").is_ok());
        let bad = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate("backoff").is_err());
        let infinite = BackoffPolicy {
            multiplier: f64::INFINITY,
            ..Default::default()
        };
        assert!(infinite.validate("backoff").is_err());
    }
}
