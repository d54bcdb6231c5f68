//! 两级缓存服务 - 业务能力层
//!
//! ## 结构
//!
//! - **内存层**：有界（条目数 + 字节数），LRU 淘汰，一把 Mutex 保护 LRU 账本
//! - **持久层**：`CacheBackend`，容量更大；任何错误只记日志，降级为未命中 / 空操作
//!
//! ## 读写规则
//!
//! - `get`：内存命中且未过期 → 返回并刷新最近使用；否则查持久层，命中且未过期 →
//!   晋升到内存层后返回；否则未命中
//! - `set`：两层都写；单个值超过内存字节预算时只写持久层
//! - 过期：每次 `get` 惰性检查，`sweep_expired` / `spawn_sweeper` 周期清扫两层
//!
//! 锁从不跨越 `.await` 持有，预热与慢后端不会阻塞其他 key 的读写。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CacheBackendError, ConfigError};
use crate::infrastructure::CacheBackend;
use crate::models::{CacheEntry, CacheTier};

// ============================================================================
// 配置
// ============================================================================

/// 两级缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 内存层最大条目数
    pub max_entries: usize,
    /// 内存层最大字节数
    pub max_bytes: u64,
    /// 未指定 TTL 时使用
    #[serde(with = "crate::config::serde_ms", rename = "default_ttl_ms")]
    pub default_ttl: Duration,
    /// 周期清扫间隔
    #[serde(with = "crate::config::serde_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
    /// 预热时同时运行的 factory 数
    pub warm_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 64 * 1024 * 1024,            // 64 MB
            default_ttl: Duration::from_secs(3600), // 1 小时
            sweep_interval: Duration::from_secs(60),
            warm_concurrency: 4,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "必须大于 0"));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::invalid("cache.max_bytes", "必须大于 0"));
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::invalid("cache.default_ttl_ms", "必须大于 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("cache.sweep_interval_ms", "必须大于 0"));
        }
        if self.warm_concurrency == 0 {
            return Err(ConfigError::invalid("cache.warm_concurrency", "必须大于 0"));
        }
        Ok(())
    }
}

// ============================================================================
// 统计
// ============================================================================

/// 缓存统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    /// 内存层当前条目数
    pub entries: usize,
    /// 内存层当前字节数
    pub bytes_used: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub backend_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    backend_errors: AtomicU64,
}

// ============================================================================
// 预热
// ============================================================================

type WarmFactory = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send>;

/// 一条预热任务，`priority` 越大越先执行
pub struct WarmEntry {
    pub key: String,
    pub ttl: Option<Duration>,
    pub priority: i32,
    factory: WarmFactory,
}

impl WarmEntry {
    pub fn new<F, Fut>(key: impl Into<String>, priority: i32, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl: None,
            priority,
            factory: Box::new(move || factory().boxed()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// 预热结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub loaded: usize,
    /// 已在缓存中，未调用 factory
    pub already_cached: usize,
    pub failed: Vec<String>,
}

/// 清扫结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub memory: usize,
    pub persistent: usize,
}

// ============================================================================
// 内存层
// ============================================================================

struct MemorySlot {
    entry: CacheEntry,
    tick: u64,
}

/// LRU 账本：`lru` 按最近使用的先后排序，最小 tick 最久未用
#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, MemorySlot>,
    lru: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: u64,
    /// 每次失效加一；读持久层期间变化则该次读取作废
    generation: u64,
}

enum MemoryLookup {
    Hit(Vec<u8>),
    Expired,
    Missing,
}

impl MemoryTier {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn lookup(&mut self, key: &str, now: chrono::DateTime<Utc>) -> MemoryLookup {
        let tick = self.tick();
        let Some(slot) = self.entries.get_mut(key) else {
            return MemoryLookup::Missing;
        };
        if slot.entry.is_expired_at(now) {
            self.remove(key);
            return MemoryLookup::Expired;
        }
        self.lru.remove(&slot.tick);
        slot.tick = tick;
        self.lru.insert(tick, key.to_string());
        MemoryLookup::Hit(slot.entry.value.clone())
    }

    fn contains_live(&self, key: &str, now: chrono::DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired_at(now))
    }

    /// 插入并淘汰到预算以内，返回被淘汰的条目数
    fn insert(&mut self, entry: CacheEntry, max_entries: usize, max_bytes: u64) -> usize {
        self.remove(&entry.key);
        let tick = self.tick();
        self.bytes += entry.size_bytes;
        self.lru.insert(tick, entry.key.clone());
        self.entries
            .insert(entry.key.clone(), MemorySlot { entry, tick });

        let mut evicted = 0;
        while self.entries.len() > max_entries || self.bytes > max_bytes {
            let Some((_, victim)) = self.lru.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&victim) {
                self.bytes -= slot.entry.size_bytes;
                evicted += 1;
                debug!("LRU 淘汰: {}", victim);
            }
        }
        evicted
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.lru.remove(&slot.tick);
        self.bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    fn keys_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect()
    }

    fn remove_expired(&mut self, now: chrono::DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// 失效模式：含 `*` / `?` 时按 glob 匹配整个 key，否则按前缀匹配
enum KeyPattern {
    Prefix(String),
    Glob(Regex),
}

impl KeyPattern {
    fn parse(pattern: &str) -> Result<Self, regex::Error> {
        if !pattern.contains(['*', '?']) {
            return Ok(Self::Prefix(pattern.to_string()));
        }
        let body = regex::escape(pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        Ok(Self::Glob(Regex::new(&format!("^{}$", body))?))
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Glob(re) => re.is_match(key),
        }
    }
}

// ============================================================================
// TieredCache
// ============================================================================

/// 两级缓存服务
///
/// 职责：
/// - 内存层 + 持久层读写、晋升、淘汰、过期
/// - 模式失效、预热、统计
/// - 不关心值的含义（字节串），JSON 辅助方法建立在其上
pub struct TieredCache {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    backend: Arc<dyn CacheBackend>,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        info!(
            "两级缓存初始化: 内存层 {} 条 / {} 字节, 默认 TTL {:?}",
            config.max_entries, config.max_bytes, config.default_ttl
        );
        Self {
            config,
            memory: Mutex::new(MemoryTier::default()),
            backend,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backend_failed(&self, op: &str, key: &str, err: &CacheBackendError) {
        self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
        warn!("持久缓存 {} 失败 (key={}): {}，降级为仅内存", op, key, err);
    }

    /// 读取
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Utc::now();

        let (lookup, generation) = {
            let mut memory = self.memory();
            (memory.lookup(key, now), memory.generation)
        };
        match lookup {
            MemoryLookup::Hit(value) => {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            MemoryLookup::Expired => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                debug!("内存层条目已过期: {}", key);
            }
            MemoryLookup::Missing => {}
        }

        match self.backend.get(key).await {
            Ok(Some(entry)) if !entry.is_expired_at(now) => {
                let value = entry.value.clone();
                if !self.promote(entry, now, generation) {
                    debug!("读取期间发生失效，丢弃持久层结果: {}", key);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(Some(_)) => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.backend.delete(key).await {
                    self.backend_failed("删除过期条目", key, &e);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.backend_failed("读取", key, &e);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 返回 false 表示读取开始后发生过失效，持久层读到的值不可再用
    fn promote(&self, entry: CacheEntry, now: chrono::DateTime<Utc>, generation: u64) -> bool {
        let mut memory = self.memory();
        if memory.generation != generation {
            return false;
        }
        if entry.size_bytes > self.config.max_bytes {
            return true;
        }
        // 读持久层期间可能有并发 set 写入了更新的值
        if memory.contains_live(&entry.key, now) {
            return true;
        }
        debug!("晋升到内存层: {}", entry.key);
        let evicted = memory.insert(
            entry.with_tier(CacheTier::Memory),
            self.config.max_entries,
            self.config.max_bytes,
        );
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        true
    }

    /// 写入两层
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let size = value.len() as u64;
        if size > self.config.max_bytes {
            debug!(
                "值过大 ({} 字节 > 内存预算 {} 字节)，只写持久层: {}",
                size, self.config.max_bytes, key
            );
            self.memory().remove(key);
        } else {
            let entry = CacheEntry::new(key, value.clone(), ttl, CacheTier::Memory);
            let evicted =
                self.memory()
                    .insert(entry, self.config.max_entries, self.config.max_bytes);
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }

        if let Err(e) = self.backend.put(key, value, ttl).await {
            self.backend_failed("写入", key, &e);
        }
    }

    /// 按前缀或 glob（`*`、`?`）从两层删除，返回删除的 key 数
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let pattern_str = pattern;
        let pattern = match KeyPattern::parse(pattern) {
            Ok(p) => p,
            Err(e) => {
                warn!("无效的失效模式 {}: {}", pattern_str, e);
                return 0;
            }
        };

        let mut removed = self.invalidate_memory(&pattern);

        match self.backend.keys().await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| pattern.matches(k)) {
                    match self.backend.delete(&key).await {
                        Ok(true) => {
                            removed.insert(key);
                        }
                        Ok(false) => {}
                        Err(e) => self.backend_failed("删除", &key, &e),
                    }
                }
            }
            Err(e) => self.backend_failed("列出 key", pattern_str, &e),
        }

        // 删除持久层期间并发 get 可能已把旧值晋升回内存层
        removed.extend(self.invalidate_memory(&pattern));

        info!("缓存失效 {}: 删除 {} 个 key", pattern_str, removed.len());
        removed.len()
    }

    fn invalidate_memory(&self, pattern: &KeyPattern) -> HashSet<String> {
        let mut memory = self.memory();
        memory.generation += 1;
        let keys = memory.keys_matching(pattern);
        for key in &keys {
            memory.remove(key);
        }
        keys.into_iter().collect()
    }

    /// 按优先级预热，已缓存的 key 不调用 factory
    pub async fn warm(&self, mut entries: Vec<WarmEntry>) -> WarmReport {
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!("开始预热 {} 个 key", entries.len());

        let results: Vec<(String, Result<bool, String>)> = futures::stream::iter(entries)
            .map(|entry| async move {
                let key = entry.key;
                if self.get(&key).await.is_some() {
                    return (key, Ok(false));
                }
                match (entry.factory)().await {
                    Ok(value) => {
                        let ttl = entry.ttl.unwrap_or(self.config.default_ttl);
                        self.set(&key, value, ttl).await;
                        (key, Ok(true))
                    }
                    Err(e) => (key, Err(e.to_string())),
                }
            })
            .buffer_unordered(self.config.warm_concurrency)
            .collect()
            .await;

        let mut report = WarmReport::default();
        for (key, result) in results {
            match result {
                Ok(true) => report.loaded += 1,
                Ok(false) => report.already_cached += 1,
                Err(e) => {
                    warn!("预热失败 {}: {}", key, e);
                    report.failed.push(key);
                }
            }
        }

        info!(
            "预热完成: 加载 {}, 已存在 {}, 失败 {}",
            report.loaded,
            report.already_cached,
            report.failed.len()
        );
        report
    }

    /// 读取，未命中时计算并写入
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// 读取 JSON 值；反序列化失败视为未命中
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("缓存值无法解析为 JSON (key={}): {}", key, e);
                None
            }
        }
    }

    /// 写入 JSON 值
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheBackendError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await;
        Ok(())
    }

    /// 清除两层中所有过期条目
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport {
            memory: self.memory().remove_expired(now),
            persistent: 0,
        };

        match self.backend.keys().await {
            Ok(keys) => {
                for key in keys {
                    match self.backend.get(&key).await {
                        Ok(Some(entry)) if entry.is_expired_at(now) => {
                            match self.backend.delete(&key).await {
                                Ok(true) => report.persistent += 1,
                                Ok(false) => {}
                                Err(e) => self.backend_failed("清扫删除", &key, &e),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => self.backend_failed("清扫读取", &key, &e),
                    }
                }
            }
            Err(e) => self.backend_failed("清扫列出 key", "*", &e),
        }

        let total = (report.memory + report.persistent) as u64;
        self.counters.expirations.fetch_add(total, Ordering::Relaxed);
        if total > 0 {
            debug!(
                "清扫过期条目: 内存层 {}, 持久层 {}",
                report.memory, report.persistent
            );
        }
        report
    }

    /// 后台周期清扫；缓存被释放后任务自动结束
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("缓存已释放，清扫任务退出");
                    break;
                };
                cache.sweep_expired().await;
            }
        })
    }

    /// 统计快照
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes_used) = {
            let memory = self.memory();
            (memory.entries.len(), memory.bytes)
        };
        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.counters.persistent_hits.load(Ordering::Relaxed);
        CacheStats {
            hits: memory_hits + persistent_hits,
            memory_hits,
            persistent_hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries,
            bytes_used,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
        }
    }

    /// 内存层是否持有该 key（不刷新 LRU，不判断过期）
    pub fn in_memory(&self, key: &str) -> bool {
        self.memory().entries.contains_key(key)
    }
}
