//! 去重索引服务 - 业务能力层
//!
//! ## 职责
//!
//! - 维护"已处理 key"的内存快照，按 TTL 从 `DedupStore` 刷新
//! - `mark_processed` 同步更新内存，异步写入持久存储
//! - `find_new`：按观测到的重复率动态放大拉取量，凑够目标数量的新 key
//!
//! 快照以 `RwLock<Arc<HashSet>>` 整体替换，读者不会看到构建到一半的集合。
//! 持久存储不可用时保留旧快照（首次加载失败则为空），候选一律按新 key 处理。

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DedupStoreError};
use crate::infrastructure::DedupStore;
use crate::models::DedupRecord;

// ========== 配置 ==========

/// 去重快照配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// 快照刷新间隔
    #[serde(with = "crate::config::serde_ms", rename = "refresh_ttl_ms")]
    pub refresh_ttl: Duration,
    /// 只看最近这段时间内处理过的 key；None 表示全部
    #[serde(
        with = "crate::config::serde_opt_ms",
        rename = "lookback_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub lookback: Option<Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: Duration::from_secs(5 * 60),
            lookback: None,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_ttl.is_zero() {
            return Err(ConfigError::invalid("dedup.refresh_ttl_ms", "必须大于 0"));
        }
        if self.lookback.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("dedup.lookback_ms", "必须大于 0"));
        }
        Ok(())
    }
}

/// 动态拉取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// 拉取量的安全系数
    pub safety_margin: f64,
    /// 最多拉取轮数
    pub max_rounds: u32,
    /// 单轮拉取上限
    pub max_fetch_size: usize,
    /// 估算拉取量时新 key 比例的下限，避免重复率接近 1 时拉取量发散
    pub min_yield: f64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            safety_margin: 1.5,
            max_rounds: 10,
            max_fetch_size: 1000,
            min_yield: 0.05,
        }
    }
}

impl IntakeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_margin.is_nan() || self.safety_margin < 1.0 {
            return Err(ConfigError::invalid("intake.safety_margin", "必须 >= 1.0"));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::invalid("intake.max_rounds", "必须大于 0"));
        }
        if self.max_fetch_size == 0 {
            return Err(ConfigError::invalid("intake.max_fetch_size", "必须大于 0"));
        }
        if !(self.min_yield > 0.0 && self.min_yield <= 1.0) {
            return Err(ConfigError::invalid("intake.min_yield", "必须在 (0, 1] 之间"));
        }
        Ok(())
    }

    fn first_request(&self, target: usize) -> usize {
        self.clamp((target as f64 * self.safety_margin).ceil())
    }

    /// `ceil(still_needed / max(1 - r, min_yield) × safety_margin)`
    fn next_request(&self, still_needed: usize, duplicate_rate: f64) -> usize {
        let yield_rate = (1.0 - duplicate_rate).max(self.min_yield);
        self.clamp((still_needed as f64 / yield_rate * self.safety_margin).ceil())
    }

    fn clamp(&self, n: f64) -> usize {
        if !n.is_finite() || n >= self.max_fetch_size as f64 {
            self.max_fetch_size
        } else {
            (n as usize).max(1)
        }
    }
}

// ========== 候选来源 ==========

/// 候选 key 来源
#[async_trait]
pub trait CandidateSource: Send {
    /// 拉取最多 `n` 个候选；返回少于 `n` 个表示来源已耗尽
    async fn fetch(&mut self, n: usize) -> anyhow::Result<Vec<String>>;
}

/// 基于固定列表的候选来源
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateSource {
    keys: VecDeque<String>,
    fetches: usize,
}

impl StaticCandidateSource {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            fetches: 0,
        }
    }

    /// 已被调用的次数
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn fetch(&mut self, n: usize) -> anyhow::Result<Vec<String>> {
        self.fetches += 1;
        let take = n.min(self.keys.len());
        Ok(self.keys.drain(..take).collect())
    }
}

// ========== 拉取结果 ==========

/// 拉取停止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    SourceExhausted,
    MaxRounds,
    SourceFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TargetReached => write!(f, "已达目标"),
            StopReason::SourceExhausted => write!(f, "来源已耗尽"),
            StopReason::MaxRounds => write!(f, "达到最大轮数"),
            StopReason::SourceFailed(e) => write!(f, "来源出错: {}", e),
        }
    }
}

/// `find_new` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeReport {
    /// 新 key，按来源顺序
    pub keys: Vec<String>,
    /// 距离目标还差多少
    pub shortfall: usize,
    pub rounds: u32,
    /// 从来源拉取的候选总数
    pub fetched: usize,
    /// 已处理或在候选流中重复出现的数量
    pub duplicates: usize,
    pub stop_reason: StopReason,
}

impl IntakeReport {
    pub fn duplicate_rate(&self) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.fetched as f64
        }
    }
}

// ========== DeduplicationIndex ==========

/// 去重索引服务
pub struct DeduplicationIndex {
    config: DedupConfig,
    intake: IntakeConfig,
    store: Arc<dyn DedupStore>,
    snapshot: RwLock<Arc<HashSet<String>>>,
    /// 本次运行标记的 key，快照重建后仍然有效
    local: Mutex<HashSet<String>>,
    refreshed_at: Mutex<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl DeduplicationIndex {
    pub fn new(config: DedupConfig, intake: IntakeConfig, store: Arc<dyn DedupStore>) -> Self {
        Self {
            config,
            intake,
            store,
            snapshot: RwLock::new(Arc::new(HashSet::new())),
            local: Mutex::new(HashSet::new()),
            refreshed_at: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Arc<HashSet<String>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn local(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_known(&self, key: &str) -> bool {
        self.local().contains(key) || self.snapshot().contains(key)
    }

    fn is_stale(&self) -> (bool, bool) {
        let refreshed_at = *self.refreshed_at.lock().unwrap_or_else(|e| e.into_inner());
        match refreshed_at {
            None => (true, true),
            Some(at) => (at.elapsed() >= self.config.refresh_ttl, false),
        }
    }

    /// 快照过期时刷新；已有快照时只让一个调用者去刷新，其余继续读旧快照
    async fn ensure_fresh(&self) {
        let (stale, never_loaded) = self.is_stale();
        if !stale {
            return;
        }

        let _guard = if never_loaded {
            self.refresh_lock.lock().await
        } else {
            match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return,
            }
        };

        // 等锁期间可能已被别人刷新
        if !self.is_stale().0 {
            return;
        }
        if let Err(e) = self.rebuild().await {
            warn!("去重存储不可用，沿用现有快照（候选按新 key 处理）: {}", e);
        }
    }

    async fn rebuild(&self) -> Result<usize, DedupStoreError> {
        let since = self.config.lookback.and_then(|lookback| {
            chrono::Duration::from_std(lookback)
                .ok()
                .and_then(|d| Utc::now().checked_sub_signed(d))
        });

        let result = self.store.list_keys(since).await;
        // 失败也记录时间，TTL 内不反复打一个不可用的存储
        *self.refreshed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let keys: HashSet<String> = result?.into_iter().collect();
        let count = keys.len();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(keys);
        info!("去重快照已刷新: {} 个已处理 key", count);
        Ok(count)
    }

    /// 立即重建快照，返回快照中的 key 数
    pub async fn refresh(&self) -> Result<usize, DedupStoreError> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild().await
    }

    /// 该 key 是否已处理过
    pub async fn is_processed(&self, key: &str) -> bool {
        self.ensure_fresh().await;
        self.is_known(key)
    }

    /// 标记为已处理：内存立即生效，持久化在后台进行
    pub fn mark_processed(&self, key: &str) {
        if !self.local().insert(key.to_string()) {
            return;
        }

        let store = Arc::clone(&self.store);
        let record = DedupRecord::new(key);
        let handle = tokio::spawn(async move {
            if let Err(e) = store.record(&record).await {
                warn!("去重记录写入失败 ({}): {}", record.key, e);
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// 等待所有后台写入完成，返回等待的任务数
    pub async fn flush(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("去重写入任务异常退出: {}", e);
            }
        }
        if count > 0 {
            debug!("去重写入已落盘: {} 条", count);
        }
        count
    }

    /// 快照与本地标记的 key 总数（可能有重叠）
    pub fn known_count(&self) -> usize {
        self.snapshot().len() + self.local().len()
    }

    /// 从 `source` 凑出 `target` 个未处理过的 key
    pub async fn find_new<S>(&self, source: &mut S, target: usize) -> IntakeReport
    where
        S: CandidateSource + ?Sized,
    {
        self.ensure_fresh().await;

        let mut keys: Vec<String> = Vec::with_capacity(target);
        let mut seen: HashSet<String> = HashSet::new();
        let mut fetched = 0usize;
        let mut duplicates = 0usize;
        let mut rounds = 0u32;
        let mut request = self.intake.first_request(target);

        let stop_reason = loop {
            if keys.len() >= target {
                break StopReason::TargetReached;
            }
            if rounds >= self.intake.max_rounds {
                break StopReason::MaxRounds;
            }
            rounds += 1;

            let batch = match source.fetch(request).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("[拉取 第{}轮] 候选来源出错: {}", rounds, e);
                    break StopReason::SourceFailed(e.to_string());
                }
            };
            let exhausted = batch.len() < request;
            let batch_len = batch.len();
            fetched += batch_len;

            let mut batch_duplicates = 0usize;
            for key in batch {
                if keys.len() >= target {
                    break;
                }
                if !seen.insert(key.clone()) || self.is_known(&key) {
                    batch_duplicates += 1;
                } else {
                    keys.push(key);
                }
            }
            duplicates += batch_duplicates;

            // 下一轮只看本轮的重复率
            let duplicate_rate = if batch_len == 0 {
                0.0
            } else {
                batch_duplicates as f64 / batch_len as f64
            };
            debug!(
                "[拉取 第{}轮] 请求 {}, 新增累计 {}/{}, 重复率 {:.1}%",
                rounds,
                request,
                keys.len(),
                target,
                duplicate_rate * 100.0
            );

            if keys.len() >= target {
                break StopReason::TargetReached;
            }
            if exhausted {
                break StopReason::SourceExhausted;
            }
            request = self
                .intake
                .next_request(target - keys.len(), duplicate_rate);
        };

        let shortfall = target.saturating_sub(keys.len());
        if shortfall > 0 {
            warn!(
                "拉取结束（{}）: 得到 {} 个新 key，缺口 {}",
                stop_reason,
                keys.len(),
                shortfall
            );
        } else {
            info!(
                "拉取完成: {} 轮, 拉取 {}, 重复 {}, 新 key {}",
                rounds,
                fetched,
                duplicates,
                keys.len()
            );
        }

        IntakeReport {
            keys,
            shortfall,
            rounds,
            fetched,
            duplicates,
            stop_reason,
        }
    }
}
