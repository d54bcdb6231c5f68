//! 业务能力层（Services）
//!
//! 每个服务描述"我能做什么"，互不依赖，也不认识批次与调度：
//!
//! - `RateLimiter` - 按外部服务保持请求间隔，自适应退避
//! - `TieredCache` - 内存 + 持久两级缓存
//! - `DeduplicationIndex` - 已处理 key 的快照与动态拉取
//! - `ErrorIsolator` - 单次处理的分类、重试与 panic 隔离
//! - `BackoffPolicy` - 前两者共用的退避参数

pub mod backoff;
pub mod dedup_index;
pub mod error_isolator;
pub mod rate_limiter;
pub mod tiered_cache;

pub use backoff::BackoffPolicy;
pub use dedup_index::{
    CandidateSource, DedupConfig, DeduplicationIndex, IntakeConfig, IntakeReport,
    StaticCandidateSource, StopReason,
};
pub use error_isolator::{ErrorIsolator, IsolatorConfig, UnitOutcome};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, ServiceLimit};
pub use tiered_cache::{CacheConfig, CacheStats, SweepReport, TieredCache, WarmEntry, WarmReport};
