//! 应用组装 - 编排层
//!
//! ## 职责
//!
//! 唯一的组装点：根据 `Config` 构造所有共享服务（限速器、两级缓存、去重索引），
//! 用 `Arc` 分发给流程层和调度器，不使用任何全局单例。
//!
//! ## 核心功能
//!
//! 1. **初始化**：校验配置、创建后端、组装 `WorkScheduler`
//! 2. **运行**：`run` / `run_to_target` 委托给调度器
//! 3. **资源管理**：持有缓存清扫任务，`shutdown` 时停止并刷新去重写入

use std::path::Path;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{
    CacheBackend, DedupStore, FileCacheBackend, JsonlDedupStore, MemoryCacheBackend,
    MemoryDedupStore,
};
use crate::models::{BatchResult, WorkUnit};
use crate::orchestrator::progress::{LoggingProgressSink, ProgressSink};
use crate::orchestrator::work_scheduler::{CancelHandle, TargetRun, WorkScheduler};
use crate::services::{CandidateSource, DeduplicationIndex, ErrorIsolator, RateLimiter, TieredCache};
use crate::workflow::{Processor, UnitFlow};

/// 缓存目录名（相对于数据目录）
const CACHE_DIR: &str = "cache";
/// 去重记录文件名（相对于数据目录）
const DEDUP_FILE: &str = "processed.jsonl";

/// 应用主结构
pub struct App {
    config: Config,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    dedup: Arc<DeduplicationIndex>,
    scheduler: WorkScheduler,
    sweeper: Option<JoinHandle<()>>,
}

impl App {
    /// 用给定的持久后端初始化应用
    pub fn new(
        config: Config,
        cache_backend: Arc<dyn CacheBackend>,
        dedup_store: Arc<dyn DedupStore>,
    ) -> AppResult<Self> {
        Self::with_progress(
            config,
            cache_backend,
            dedup_store,
            Arc::new(LoggingProgressSink),
        )
    }

    /// 同 `new`，自定义进度接收方
    pub fn with_progress(
        config: Config,
        cache_backend: Arc<dyn CacheBackend>,
        dedup_store: Arc<dyn DedupStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<Self> {
        config.validate()?;
        log_startup(&config);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let cache = Arc::new(TieredCache::new(config.cache.clone(), cache_backend));
        let dedup = Arc::new(DeduplicationIndex::new(
            config.dedup.clone(),
            config.intake.clone(),
            dedup_store,
        ));

        let flow = Arc::new(UnitFlow::new(
            ErrorIsolator::new(config.isolator.clone()),
            Arc::clone(&rate_limiter),
            Arc::clone(&cache),
            Arc::clone(&dedup),
            config.scheduler.paced_services.clone(),
            config.scheduler.unit_timeout,
        ));
        let scheduler = WorkScheduler::new(config.scheduler.clone(), flow, progress)?;

        Ok(Self {
            config,
            rate_limiter,
            cache,
            dedup,
            scheduler,
            sweeper: None,
        })
    }

    /// 全部使用进程内后端
    pub fn in_memory(config: Config) -> AppResult<Self> {
        Self::new(
            config,
            Arc::new(MemoryCacheBackend::new()),
            Arc::new(MemoryDedupStore::new()),
        )
    }

    /// 使用 `data_dir` 下的文件后端：`cache/` 目录与 `processed.jsonl`
    pub async fn with_data_dir(config: Config, data_dir: impl AsRef<Path>) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        let cache_backend = FileCacheBackend::open(data_dir.join(CACHE_DIR)).await?;
        let dedup_store = JsonlDedupStore::new(data_dir.join(DEDUP_FILE));
        info!("📁 数据目录: {}", data_dir.display());
        Self::new(config, Arc::new(cache_backend), Arc::new(dedup_store))
    }

    /// 启动后台缓存清扫（重复调用无效果）
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_none() {
            self.sweeper = Some(self.cache.spawn_sweeper(self.config.cache.sweep_interval));
        }
    }

    /// 处理一批单元
    pub async fn run(&self, units: Vec<WorkUnit>, processor: Arc<dyn Processor>) -> BatchResult {
        self.scheduler.submit_batch(units, processor).await
    }

    /// 从候选来源凑够 `target` 个新 key 并处理
    pub async fn run_to_target<S, F>(
        &self,
        source: &mut S,
        target: usize,
        payload_for: F,
        processor: Arc<dyn Processor>,
    ) -> TargetRun
    where
        S: CandidateSource + ?Sized,
        F: Fn(&str) -> JsonValue,
    {
        self.scheduler
            .run_to_target(source, target, payload_for, processor)
            .await
    }

    /// 停止清扫任务并等待去重写入落盘
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.dedup.flush().await;
        let stats = self.cache.stats();
        info!(
            "🛑 应用关闭: 缓存命中率 {:.1}%, 淘汰 {}, 后端错误 {}",
            stats.hit_rate() * 100.0,
            stats.evictions,
            stats.backend_errors
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &WorkScheduler {
        &self.scheduler
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.scheduler.cancel_handle()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn dedup(&self) -> &Arc<DeduplicationIndex> {
        &self.dedup
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 工作单元处理引擎启动");
    info!("📊 并发 worker 数: {}", config.scheduler.worker_count);
    info!("⏱ 单次调用超时: {:?}", config.scheduler.unit_timeout);
    if !config.scheduler.paced_services.is_empty() {
        info!("🚦 限速服务: {}", config.scheduler.paced_services.join(", "));
    }
    info!("{}", "=".repeat(60));
}
