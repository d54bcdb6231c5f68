//! 缓存条目

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 条目所在的缓存层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Memory,
    Persistent,
}

/// 一条缓存记录
///
/// `now > created_at + ttl` 之后，`get` 必须把它当作不存在。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::config::serde_ms", rename = "ttl_ms")]
    pub ttl: Duration,
    pub size_bytes: u64,
    pub tier: CacheTier,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration, tier: CacheTier) -> Self {
        Self::created_at(key, value, ttl, tier, Utc::now())
    }

    pub fn created_at(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Duration,
        tier: CacheTier,
        created_at: DateTime<Utc>,
    ) -> Self {
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            created_at,
            ttl,
            size_bytes,
            tier,
        }
    }

    /// 过期时间点
    pub fn expires_at(&self) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => self
                .created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// 复制为另一层的条目，保留原始创建时间与 TTL
    pub fn with_tier(&self, tier: CacheTier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }
}
