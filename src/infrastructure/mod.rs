//! 基础设施层（Infrastructure）
//!
//! 持有外部存储资源，只暴露读写能力，不包含任何缓存 / 去重策略。

pub mod cache_backend;
pub mod dedup_store;

pub use cache_backend::{CacheBackend, FileCacheBackend, MemoryCacheBackend};
pub use dedup_store::{DedupStore, JsonlDedupStore, MemoryDedupStore};
