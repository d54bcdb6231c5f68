//! 限速服务 - 业务能力层
//!
//! 只负责"对某个外部服务的请求保持最小间隔"能力，不关心流程。
//!
//! ## 设计
//!
//! - 每个服务一个 `ServiceSlot`，所有 worker 共享
//! - 放行门（`gate`）是公平的 tokio Mutex：排队的 worker 按先来后到依次等待，
//!   持锁期间睡到下一个可放行时刻，不做忙等
//! - 退避状态单独一把同步锁，`report_outcome` 不会被正在睡眠的等待者阻塞
//! - 连续失败时有效间隔按倍数放大（有上限），成功时额外退避减半

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, UnitError};
use crate::models::RateLimitState;
use crate::services::backoff::BackoffPolicy;

/// 额外退避低于此值时直接归零
const BACKOFF_FLOOR: Duration = Duration::from_millis(1);

/// min_interval 为零时首次退避的起点
const ZERO_INTERVAL_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// 服务端建议等待时间的上限
const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// 单个服务的限速参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLimit {
    /// 两次放行之间的最小间隔
    #[serde(with = "crate::config::serde_ms", rename = "min_interval_ms")]
    pub min_interval: Duration,
    /// 每次连续失败时有效间隔的放大倍数
    pub backoff_factor: f64,
    /// 有效间隔上限
    #[serde(with = "crate::config::serde_ms", rename = "max_interval_ms")]
    pub max_interval: Duration,
}

impl Default for ServiceLimit {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(300),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ServiceLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: Self::default().max_interval.max(min_interval),
            ..Default::default()
        }
    }

    fn backoff_policy(&self) -> BackoffPolicy {
        let base = if self.min_interval.is_zero() {
            ZERO_INTERVAL_BACKOFF_BASE.min(self.max_interval)
        } else {
            self.min_interval
        };
        BackoffPolicy::new(base, self.backoff_factor, self.max_interval)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                format!("{}.backoff_factor", field),
                "必须是 >= 1.0 的有限数",
            ));
        }
        if self.max_interval < self.min_interval {
            return Err(ConfigError::invalid(
                format!("{}.max_interval_ms", field),
                "不能小于 min_interval_ms",
            ));
        }
        Ok(())
    }
}

/// 限速配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// 未单独配置的服务使用的参数
    pub default_limit: ServiceLimit,
    /// 按服务名单独配置
    pub services: HashMap<String, ServiceLimit>,
}

impl RateLimiterConfig {
    pub fn with_service(mut self, name: impl Into<String>, limit: ServiceLimit) -> Self {
        self.services.insert(name.into(), limit);
        self
    }

    pub fn limit_for(&self, service: &str) -> ServiceLimit {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_limit.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_limit.validate("rate_limits.default_limit")?;
        for (name, limit) in &self.services {
            limit.validate(&format!("rate_limits.services.{}", name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    current_backoff: Duration,
}

/// 单个服务的共享状态
struct ServiceSlot {
    limit: ServiceLimit,
    policy: BackoffPolicy,
    /// 上一次放行时间
    gate: tokio::sync::Mutex<Option<Instant>>,
    backoff: Mutex<BackoffState>,
}

impl ServiceSlot {
    fn new(limit: ServiceLimit) -> Self {
        Self {
            policy: limit.backoff_policy(),
            limit,
            gate: tokio::sync::Mutex::new(None),
            backoff: Mutex::new(BackoffState::default()),
        }
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn effective_interval(&self) -> Duration {
        self.limit
            .min_interval
            .saturating_add(self.backoff().current_backoff)
    }
}

/// 限速服务
///
/// 职责：
/// - 按服务名维护最小请求间隔
/// - 根据调用结果自适应退避
/// - 不认识 WorkUnit，不关心重试
pub struct RateLimiter {
    config: RateLimiterConfig,
    services: DashMap<String, Arc<ServiceSlot>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
        }
    }

    /// 所有服务使用同一个最小间隔
    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self::new(RateLimiterConfig {
            default_limit: ServiceLimit::new(min_interval),
            services: HashMap::new(),
        })
    }

    fn slot(&self, service: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.services.get(service) {
            return Arc::clone(slot.value());
        }
        let entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::new(self.config.limit_for(service))));
        Arc::clone(entry.value())
    }

    /// 等待直到可以向 `service` 发出下一个请求，返回放行时刻
    pub async fn acquire(&self, service: &str) -> Instant {
        let slot = self.slot(service);
        let mut last = slot.gate.lock().await;

        if let Some(prev) = *last {
            let ready_at = prev
                .checked_add(slot.effective_interval())
                .unwrap_or_else(|| prev + MAX_RETRY_AFTER);
            if ready_at > Instant::now() {
                debug!(
                    "[限速 {}] 等待 {:?}",
                    service,
                    ready_at.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let granted = Instant::now();
        *last = Some(granted);
        granted
    }

    /// 报告一次请求的结果
    pub fn report_outcome(&self, service: &str, success: bool) {
        let slot = self.slot(service);
        let mut state = slot.backoff();

        if success {
            state.consecutive_failures = 0;
            if !state.current_backoff.is_zero() {
                let halved = state.current_backoff / 2;
                state.current_backoff = if halved < BACKOFF_FLOOR {
                    Duration::ZERO
                } else {
                    halved
                };
                debug!("[限速 {}] 退避衰减至 {:?}", service, state.current_backoff);
            }
            return;
        }

        state.consecutive_failures += 1;
        let effective = slot.limit.min_interval.saturating_add(state.current_backoff);
        let grown = slot.policy.grow(effective);
        state.current_backoff = grown.saturating_sub(slot.limit.min_interval);

        warn!(
            "[限速 {}] 连续失败 {} 次，有效间隔调整为 {:?}",
            service,
            state.consecutive_failures,
            slot.limit.min_interval.saturating_add(state.current_backoff)
        );
    }

    /// 报告一次明确的限流响应，可带服务端建议的等待时间
    pub fn report_rate_limited(&self, service: &str, retry_after: Option<Duration>) {
        self.report_outcome(service, false);

        if let Some(retry_after) = retry_after {
            let retry_after = retry_after.min(MAX_RETRY_AFTER);
            let slot = self.slot(service);
            let mut state = slot.backoff();
            let required = retry_after.saturating_sub(slot.limit.min_interval);
            if required > state.current_backoff {
                info!(
                    "[限速 {}] 服务端要求等待 {:?}，提高退避",
                    service, retry_after
                );
                state.current_backoff = required;
            }
        }
    }

    /// 限速执行一次调用并自动回报结果
    pub async fn paced<T, Fut>(&self, service: &str, call: Fut) -> Result<T, UnitError>
    where
        Fut: Future<Output = Result<T, UnitError>>,
    {
        self.acquire(service).await;
        let result = call.await;
        match &result {
            Ok(_) => self.report_outcome(service, true),
            Err(UnitError::RateLimited { retry_after, .. }) => {
                self.report_rate_limited(service, *retry_after)
            }
            Err(e) if e.kind() == crate::error::ErrorKind::Transient => {
                self.report_outcome(service, false)
            }
            // 校验失败等与服务端负载无关
            Err(_) => {}
        }
        result
    }

    /// 当前状态快照
    pub fn state(&self, service: &str) -> RateLimitState {
        let slot = self.slot(service);
        let last_request_at = slot.gate.try_lock().ok().and_then(|g| *g);
        let backoff = slot.backoff();
        RateLimitState {
            service_name: service.to_string(),
            last_request_at,
            min_interval: slot.limit.min_interval,
            consecutive_failures: backoff.consecutive_failures,
            current_backoff: backoff.current_backoff,
        }
    }

    /// 已出现过的服务名
    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}
