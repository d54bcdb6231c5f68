//! 限速状态与去重记录

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 某个外部服务的限速状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    pub service_name: String,
    /// 上一次放行的时间（tokio 时钟）
    pub last_request_at: Option<tokio::time::Instant>,
    pub min_interval: Duration,
    pub consecutive_failures: u32,
    /// 叠加在 `min_interval` 之上的退避时长
    pub current_backoff: Duration,
}

impl RateLimitState {
    /// 当前实际生效的间隔
    pub fn effective_interval(&self) -> Duration {
        self.min_interval.saturating_add(self.current_backoff)
    }
}

/// 一条去重记录，单元成功时写入持久存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub key: String,
    pub processed_at: DateTime<Utc>,
    /// 保留期，None 表示永久
    #[serde(
        with = "crate::config::serde_opt_ms",
        rename = "ttl_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl: Option<Duration>,
}

impl DedupRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            processed_at: Utc::now(),
            ttl: None,
        }
    }

    /// 记录是否仍在保留期内
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => self
                .processed_at
                .checked_add_signed(ttl)
                .map(|expires| now <= expires)
                .unwrap_or(true),
            None => true,
        }
    }
}
