//! 工作调度器 - 编排层
//!
//! ## 职责
//!
//! 接收一批工作单元，分发到有界的工作池，汇总为 `BatchResult`。
//!
//! ## 核心功能
//!
//! 1. **预处理**：批内重复 key、被其他批次占用的 key 直接 Skipped
//! 2. **并发控制**：`worker_count` 个 worker 从共享队列拉取单元（JoinSet 结构化并发）
//! 3. **协作式取消**：每次派发前检查取消标志，未派发的单元 Skipped(Cancelled)；
//!    所有进行中的批次结束后标志自动清除
//! 4. **进度**：每个单元进入终态后发出一次快照，`processed` 单调递增
//! 5. **收尾**：等待所有 worker 退出，补齐异常退出 worker 手上的单元，刷新去重写入
//!
//! ## 设计特点
//!
//! - **向下委托**：单元内部的流程全部交给 `workflow::UnitFlow`
//! - **不丢单元**：`submit_batch` 返回时，每个提交的单元都恰好处于一个终态

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::models::{BatchResult, ProgressSnapshot, SkipReason, UnitStatus, WorkUnit};
use crate::orchestrator::progress::ProgressSink;
use crate::services::{CandidateSource, DeduplicationIndex, IntakeReport};
use crate::utils::logging::{log_batch_complete, log_batch_start};
use crate::workflow::unit_flow::fail_abandoned;
use crate::workflow::{Processor, UnitFlow};

/// 工作池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 并发 worker 数
    pub worker_count: usize,
    /// 单次 Processor 调用的超时
    #[serde(with = "crate::config::serde_ms", rename = "unit_timeout_ms")]
    pub unit_timeout: Duration,
    /// 每次尝试前都要限速的外部服务
    pub paced_services: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            unit_timeout: Duration::from_secs(120),
            paced_services: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("scheduler.worker_count", "必须大于 0"));
        }
        if self.unit_timeout.is_zero() {
            return Err(ConfigError::invalid("scheduler.unit_timeout_ms", "必须大于 0"));
        }
        if self.paced_services.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid("scheduler.paced_services", "服务名不能为空"));
        }
        Ok(())
    }
}

/// 协作式取消标志
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 手动清除标志；调度器在所有进行中的批次结束后也会自动清除
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// `run_to_target` 的结果
#[derive(Debug, Clone)]
pub struct TargetRun {
    pub intake: IntakeReport,
    pub batch: BatchResult,
}

/// 批次内共享的进度与结果，同一把锁下更新并发出快照
struct BatchState {
    result: BatchResult,
    snapshot: ProgressSnapshot,
}

impl BatchState {
    fn finish(&mut self, unit: WorkUnit, sink: &dyn ProgressSink) {
        match unit.status {
            UnitStatus::Succeeded => self.snapshot.succeeded += 1,
            UnitStatus::Failed => self.snapshot.failed += 1,
            _ => self.snapshot.skipped += 1,
        }
        self.snapshot.processed += 1;
        self.snapshot.current_key = Some(unit.key.clone());
        self.result.record(unit);
        sink.on_progress(&self.snapshot);
    }
}

/// 一个批次运行期间 worker 共享的东西
struct BatchShared {
    queue: Mutex<VecDeque<(usize, WorkUnit)>>,
    /// worker id → 正在处理的单元（派发时的副本）
    active: Mutex<HashMap<usize, WorkUnit>>,
    state: Mutex<BatchState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 工作调度器
pub struct WorkScheduler {
    config: SchedulerConfig,
    flow: Arc<UnitFlow>,
    progress: Arc<dyn ProgressSink>,
    /// 所有进行中批次认领的 key
    claimed: Arc<Mutex<HashSet<String>>>,
    cancel: CancelHandle,
    /// 进行中的批次数，归零时清除取消标志
    active_batches: AtomicUsize,
}

impl WorkScheduler {
    pub fn new(
        config: SchedulerConfig,
        flow: Arc<UnitFlow>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            flow,
            progress,
            claimed: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancelHandle::new(),
            active_batches: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 取消句柄，可克隆到其他任务中
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn dedup(&self) -> &Arc<DeduplicationIndex> {
        self.flow.dedup()
    }

    fn release(&self, key: &str) {
        lock(&self.claimed).remove(key);
    }

    /// 处理一批单元
    ///
    /// # 返回
    /// 所有单元都进入终态后返回；单个单元失败不会中断批次
    pub async fn submit_batch(
        &self,
        units: Vec<WorkUnit>,
        processor: Arc<dyn Processor>,
    ) -> BatchResult {
        let started = Instant::now();
        let total = units.len();
        let worker_count = self.config.worker_count.min(total.max(1));
        log_batch_start(total, worker_count);

        self.active_batches.fetch_add(1, Ordering::SeqCst);
        if self.cancel.is_cancelled() {
            warn!("⚠️ 批次开始时已处于取消状态，{} 个单元将不会被派发", total);
        }

        let shared = Arc::new(BatchShared {
            queue: Mutex::new(VecDeque::with_capacity(total)),
            active: Mutex::new(HashMap::new()),
            state: Mutex::new(BatchState {
                result: BatchResult::default(),
                snapshot: ProgressSnapshot {
                    total,
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    skipped: 0,
                    current_key: None,
                    started_at: Utc::now(),
                },
            }),
        });

        // ========== 预处理 ==========
        let mut seen: HashSet<String> = HashSet::with_capacity(total);
        for (position, mut unit) in units.into_iter().enumerate() {
            let index = position + 1;

            if unit.status != UnitStatus::Pending {
                if unit.status == UnitStatus::InProgress {
                    warn!("[单元 #{} {}] 提交时已在处理中，标记为失败", index, unit.key);
                    fail_abandoned(&mut unit, "提交时状态为 in_progress");
                } else {
                    debug!("[单元 #{} {}] 已是终态 {}，原样返回", index, unit.key, unit.status);
                }
                lock(&shared.state).finish(unit, self.progress.as_ref());
                continue;
            }

            let reason = if !seen.insert(unit.key.clone()) {
                Some(SkipReason::DuplicateInBatch)
            } else if !lock(&self.claimed).insert(unit.key.clone()) {
                Some(SkipReason::InFlightElsewhere)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!("[单元 #{} {}] 跳过: {:?}", index, unit.key, reason);
                    if let Err(e) = unit.skip(reason) {
                        error!("{}", e);
                    }
                    lock(&shared.state).finish(unit, self.progress.as_ref());
                }
                None => lock(&shared.queue).push_back((index, unit)),
            }
        }

        // ========== 派发 ==========
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let flow = Arc::clone(&self.flow);
            let processor = Arc::clone(&processor);
            let progress = Arc::clone(&self.progress);
            let claimed = Arc::clone(&self.claimed);
            let cancel = self.cancel.clone();

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!("[worker {}] 收到取消信号，停止派发", worker_id);
                        break;
                    }
                    let next = lock(&shared.queue).pop_front();
                    let Some((index, mut unit)) = next else {
                        break;
                    };

                    lock(&shared.active).insert(worker_id, unit.clone());
                    flow.run(&mut unit, index, processor.as_ref()).await;
                    lock(&shared.active).remove(&worker_id);

                    lock(&claimed).remove(&unit.key);
                    lock(&shared.state).finish(unit, progress.as_ref());
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker 异常退出: {}", e);
            }
        }

        // ========== 收尾 ==========
        let abandoned: Vec<WorkUnit> = lock(&shared.active).drain().map(|(_, u)| u).collect();
        for mut unit in abandoned {
            error!("[单元 {}] 所在 worker 异常退出，标记为失败", unit.key);
            fail_abandoned(&mut unit, "worker panicked");
            self.release(&unit.key);
            lock(&shared.state).finish(unit, self.progress.as_ref());
        }

        let leftover: Vec<(usize, WorkUnit)> = lock(&shared.queue).drain(..).collect();
        if !leftover.is_empty() {
            info!("⏹ {} 个单元未派发，标记为已取消", leftover.len());
        }
        for (_, mut unit) in leftover {
            if let Err(e) = unit.skip(SkipReason::Cancelled) {
                error!("{}", e);
            }
            self.release(&unit.key);
            lock(&shared.state).finish(unit, self.progress.as_ref());
        }

        self.flow.dedup().flush().await;

        if self.active_batches.fetch_sub(1, Ordering::SeqCst) == 1 && self.cancel.is_cancelled() {
            self.cancel.reset();
            info!("所有批次已结束，清除取消标志");
        }

        let mut result = std::mem::take(&mut lock(&shared.state).result);
        result.duration = started.elapsed();
        log_batch_complete(&result);
        result
    }

    /// 从候选来源凑够 `target` 个新 key 后作为一个批次处理
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
        let intake = self.flow.dedup().find_new(source, target).await;
        let units: Vec<WorkUnit> = intake
            .keys
            .iter()
            .map(|key| WorkUnit::new(key.clone(), payload_for(key)))
            .collect();

        let batch = self.submit_batch(units, processor).await;
        TargetRun { intake, batch }
    }
}
