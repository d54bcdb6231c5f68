//! 单元处理流程 - 流程层
//!
//! 核心职责：定义"一个工作单元"的完整处理流程
//!
//! 流程顺序：
//! 1. 去重检查 → 已处理则 Skipped
//! 2. Pending → InProgress
//! 3. ErrorIsolator 包裹：限速 → 带超时调用 Processor → 回报限速结果
//! 4. Succeeded（记入去重索引）或 Failed

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::{ClassifiedError, ErrorKind, UnitError};
use crate::models::{SkipReason, UnitStatus, WorkUnit};
use crate::services::{DeduplicationIndex, ErrorIsolator, RateLimiter, TieredCache, UnitOutcome};
use crate::utils::logging::truncate_text;
use crate::workflow::processor::Processor;
use crate::workflow::unit_ctx::UnitCtx;

/// 单元处理流程
///
/// - 编排去重、限速、超时、重试
/// - 决定单元最终落在哪个终态
/// - 不关心批次和并发（那是编排层的事）
pub struct UnitFlow {
    isolator: ErrorIsolator,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    dedup: Arc<DeduplicationIndex>,
    paced_services: Vec<String>,
    unit_timeout: Duration,
}

impl UnitFlow {
    pub fn new(
        isolator: ErrorIsolator,
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
        dedup: Arc<DeduplicationIndex>,
        paced_services: Vec<String>,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            isolator,
            rate_limiter,
            cache,
            dedup,
            paced_services,
            unit_timeout,
        }
    }

    pub fn dedup(&self) -> &Arc<DeduplicationIndex> {
        &self.dedup
    }

    /// 处理一个 Pending 单元，返回时单元一定处于终态
    pub async fn run(&self, unit: &mut WorkUnit, index: usize, processor: &dyn Processor) {
        let label = truncate_text(&unit.key, 48);

        // ========== 1. 去重 ==========
        if self.dedup.is_processed(&unit.key).await {
            debug!("[单元 #{} {}] 已处理过，跳过", index, label);
            if let Err(e) = unit.skip(SkipReason::AlreadyProcessed) {
                error!("[单元 #{} {}] {}", index, label, e);
            }
            return;
        }

        if let Err(e) = unit.start() {
            error!("[单元 #{} {}] {}", index, label, e);
            return;
        }
        debug!("[单元 #{} {}] 开始处理", index, label);

        // ========== 2. 隔离执行 ==========
        let payload = &unit.payload;
        let key = unit.key.as_str();
        let outcome = self
            .isolator
            .run(key, move |attempt| {
                let ctx = UnitCtx::new(
                    key,
                    index,
                    attempt,
                    Arc::clone(&self.rate_limiter),
                    Arc::clone(&self.cache),
                );
                async move { self.attempt_once(&ctx, payload, processor).await }
            })
            .await;

        // ========== 3. 终态 ==========
        let transition = match outcome {
            UnitOutcome::Succeeded { value, attempts } => {
                info!(
                    "[单元 #{} {}] ✓ 处理成功 (尝试 {} 次)",
                    index, label, attempts
                );
                self.dedup.mark_processed(&unit.key);
                unit.succeed(value, attempts)
            }
            UnitOutcome::Failed { error, attempts } => {
                error!(
                    "[单元 #{} {}] ❌ 处理失败 (尝试 {} 次): {}",
                    index, label, attempts, error
                );
                unit.fail(error, attempts)
            }
        };
        if let Err(e) = transition {
            error!("[单元 #{} {}] {}", index, label, e);
        }
    }

    /// 一次尝试：限速 → 超时调用 → 回报
    async fn attempt_once(
        &self,
        ctx: &UnitCtx,
        payload: &serde_json::Value,
        processor: &dyn Processor,
    ) -> Result<serde_json::Value, UnitError> {
        for service in &self.paced_services {
            self.rate_limiter.acquire(service).await;
        }

        let result =
            match tokio::time::timeout(self.unit_timeout, processor.process_unit(ctx, payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(UnitError::Timeout(self.unit_timeout)),
            };

        self.report_to_limiter(&result);
        result
    }

    fn report_to_limiter(&self, result: &Result<serde_json::Value, UnitError>) {
        match result {
            Ok(_) => {
                for service in &self.paced_services {
                    self.rate_limiter.report_outcome(service, true);
                }
            }
            Err(UnitError::RateLimited {
                service,
                retry_after,
            }) => {
                self.rate_limiter.report_rate_limited(service, *retry_after);
            }
            Err(e) if e.kind() == ErrorKind::Transient => {
                for service in &self.paced_services {
                    self.rate_limiter.report_outcome(service, false);
                }
            }
            Err(_) => {}
        }
    }
}

/// 工作线程异常退出时，把它手上的单元标记为失败
pub(crate) fn fail_abandoned(unit: &mut WorkUnit, reason: &str) {
    let error = ClassifiedError::new(ErrorKind::Permanent, reason);
    let attempts = unit.attempts;
    let started = if unit.status == UnitStatus::Pending {
        unit.start()
    } else {
        Ok(())
    };
    if let Err(e) = started.and_then(|_| unit.fail(error, attempts)) {
        error!("[单元 {}] 无法标记为失败: {}", unit.key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{MemoryCacheBackend, MemoryDedupStore};
    use crate::services::{
        BackoffPolicy, CacheConfig, DedupConfig, IntakeConfig, IsolatorConfig, RateLimiterConfig,
    };
    use crate::workflow::processor::FnProcessor;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flow(store: Arc<MemoryDedupStore>, paced: Vec<String>, timeout: Duration) -> UnitFlow {
        let isolator = ErrorIsolator::new(IsolatorConfig {
            max_retries: 2,
            unknown_retries: 1,
            backoff: BackoffPolicy::new(Duration::from_millis(5), 2.0, Duration::from_millis(20)),
        });
        UnitFlow::new(
            isolator,
            Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            Arc::new(TieredCache::new(
                CacheConfig::default(),
                Arc::new(MemoryCacheBackend::new()),
            )),
            Arc::new(DeduplicationIndex::new(
                DedupConfig::default(),
                IntakeConfig::default(),
                store,
            )),
            paced,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_already_processed_is_skipped() {
        let flow = flow(
            Arc::new(MemoryDedupStore::with_keys(["done.com"])),
            vec![],
            Duration::from_secs(5),
        );
        let processor = FnProcessor::new(|_ctx, _payload| async { Ok(json!(null)) });
        let mut unit = WorkUnit::new("done.com", json!({}));

        flow.run(&mut unit, 1, &processor).await;

        assert_eq!(unit.status, UnitStatus::Skipped);
        assert_eq!(unit.skip_reason, Some(SkipReason::AlreadyProcessed));
        assert_eq!(unit.attempts, 0);
    }

    #[tokio::test]
    async fn test_success_marks_processed() {
        let store = Arc::new(MemoryDedupStore::new());
        let flow = flow(store.clone(), vec![], Duration::from_secs(5));
        let processor = FnProcessor::new(|ctx: UnitCtx, payload: serde_json::Value| async move {
            Ok(json!({ "key": ctx.key, "name": payload["name"] }))
        });
        let mut unit = WorkUnit::new("acme.com", json!({ "name": "Acme" }));

        flow.run(&mut unit, 1, &processor).await;

        assert_eq!(unit.status, UnitStatus::Succeeded);
        assert_eq!(unit.output, Some(json!({ "key": "acme.com", "name": "Acme" })));
        assert!(flow.dedup().is_processed("acme.com").await);
        flow.dedup().flush().await;
        assert!(store.contains("acme.com"));
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let flow = flow(
            Arc::new(MemoryDedupStore::new()),
            vec![],
            Duration::from_millis(20),
        );
        let counter = calls.clone();
        let processor = FnProcessor::new(move |_ctx, _payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(null))
            }
        });
        let mut unit = WorkUnit::new("slow.com", json!({}));

        flow.run(&mut unit, 1, &processor).await;

        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(unit.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(unit.error.as_ref().map(|e| e.kind), Some(ErrorKind::Transient));
    }

    #[tokio::test]
    async fn test_paced_services_feed_rate_limiter() {
        let flow = flow(
            Arc::new(MemoryDedupStore::new()),
            vec!["search".to_string()],
            Duration::from_secs(5),
        );
        let processor = FnProcessor::new(|_ctx, _payload| async {
            Err(UnitError::validation("bad payload"))
        });
        let mut unit = WorkUnit::new("x.com", json!({}));

        flow.run(&mut unit, 1, &processor).await;

        assert_eq!(unit.status, UnitStatus::Failed);
        let state = flow.rate_limiter.state("search");
        assert!(state.last_request_at.is_some());
        assert_eq!(state.consecutive_failures, 0);
    }
}
