use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enrich_dispatch::{
    App, BackoffPolicy, Config, ErrorKind, FnProcessor, MemoryCacheBackend, MemoryDedupStore,
    ProgressSnapshot, SkipReason, StaticCandidateSource, StopReason, UnitCtx, UnitError,
    UnitStatus, WorkUnit,
};
use serde_json::{json, Value as JsonValue};

fn test_config(worker_count: usize) -> Config {
    let mut config = Config::default();
    config.scheduler.worker_count = worker_count;
    config.scheduler.unit_timeout = Duration::from_secs(5);
    config.isolator.max_retries = 3;
    config.isolator.backoff =
        BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(10));
    config
}

fn app_with(config: Config, processed: &[String]) -> (App, Arc<MemoryDedupStore>) {
    let store = Arc::new(MemoryDedupStore::with_keys(processed.iter().cloned()));
    let app = App::new(config, Arc::new(MemoryCacheBackend::new()), store.clone()).unwrap();
    (app, store)
}

fn units(keys: &[String]) -> Vec<WorkUnit> {
    keys.iter()
        .map(|k| WorkUnit::new(k.clone(), json!({ "domain": k })))
        .collect()
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("company-{:02}.com", i)).collect()
}

#[tokio::test]
async fn test_processed_keys_are_skipped() {
    let all = keys(50);
    let (app, _store) = app_with(test_config(4), &all[..40]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let processor = FnProcessor::new(move |ctx: UnitCtx, _payload: JsonValue| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "enriched": ctx.key }))
        }
    });

    let result = app.run(units(&all), Arc::new(processor)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(result.succeeded.len(), 10);
    assert_eq!(result.skipped.len(), 40);
    assert!(result
        .skipped
        .iter()
        .all(|u| u.skip_reason == Some(SkipReason::AlreadyProcessed) && u.attempts == 0));
    assert!(result.succeeded.iter().all(|u| !all[..40].contains(&u.key)));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (app, _store) = app_with(test_config(2), &[]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let processor = FnProcessor::new(move |_ctx: UnitCtx, _payload: JsonValue| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UnitError::transient("connection reset by peer"))
            } else {
                Ok(json!("ok"))
            }
        }
    });

    let result = app
        .run(units(&["flaky.com".to_string()]), Arc::new(processor))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(result.succeeded[0].attempts, 3);
    assert_eq!(result.succeeded[0].status, UnitStatus::Succeeded);
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let (app, store) = app_with(test_config(4), &[]);

    let processor = FnProcessor::new(|ctx: UnitCtx, _payload: JsonValue| async move {
        match ctx.key.as_str() {
            "invalid.com" => Err(UnitError::validation("no such domain")),
            "panics.com" => panic!("scraper crashed"),
            "down.com" => Err(UnitError::transient("503")),
            _ => Ok(json!(true)),
        }
    });

    let batch: Vec<String> = ["a.com", "invalid.com", "b.com", "panics.com", "down.com", "c.com"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let result = app.run(units(&batch), Arc::new(processor)).await;

    assert_eq!(result.total(), 6);
    assert_eq!(result.succeeded.len(), 3);
    assert_eq!(result.failed.len(), 3);

    let kind_of = |key: &str| {
        result
            .failed
            .iter()
            .find(|u| u.key == key)
            .and_then(|u| u.error.as_ref())
            .map(|e| e.kind)
    };
    assert_eq!(kind_of("invalid.com"), Some(ErrorKind::Permanent));
    assert_eq!(kind_of("panics.com"), Some(ErrorKind::Permanent));
    assert_eq!(kind_of("down.com"), Some(ErrorKind::Transient));

    // 只有成功的单元会写入去重存储
    assert!(store.contains("a.com"));
    assert!(!store.contains("invalid.com"));
}

#[tokio::test]
async fn test_cancellation_skips_undispatched_units() {
    let (app, _store) = app_with(test_config(1), &[]);
    let cancel = app.cancel_handle();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let processor = FnProcessor::new(move |_ctx: UnitCtx, _payload: JsonValue| {
        let counter = counter.clone();
        let cancel = cancel.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                cancel.cancel();
            }
            Ok(json!(null))
        }
    });

    let processor = Arc::new(processor);
    let result = app.run(units(&keys(20)), processor.clone()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(result.succeeded.len(), 5);
    assert_eq!(result.skipped.len(), 15);
    assert!(result
        .skipped
        .iter()
        .all(|u| u.skip_reason == Some(SkipReason::Cancelled)));
    assert_eq!(result.total(), 20);

    // 取消只作用于当时的批次，下一批正常派发
    assert!(!app.cancel_handle().is_cancelled());
    let rerun = app.run(units(&keys(20)), processor).await;
    assert_eq!(rerun.succeeded.len(), 15);
    assert_eq!(rerun.skipped.len(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_every_unit_reaches_one_terminal_state() {
    let (app, _store) = app_with(test_config(8), &[]);

    let active: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (active_c, overlaps_c) = (active.clone(), overlaps.clone());
    let processor = FnProcessor::new(move |ctx: UnitCtx, _payload: JsonValue| {
        let active = active_c.clone();
        let overlaps = overlaps_c.clone();
        async move {
            if !active.lock().unwrap().insert(ctx.key.clone()) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            active.lock().unwrap().remove(&ctx.key);
            Ok(json!(ctx.attempt))
        }
    });

    // 每个 key 出现三次
    let mut batch = keys(30);
    batch.extend(keys(30));
    batch.extend(keys(30));
    let result = app.run(units(&batch), Arc::new(processor)).await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(result.total(), 90);
    assert_eq!(result.succeeded.len(), 30);
    assert_eq!(result.skipped.len(), 60);
    assert!(result
        .skipped
        .iter()
        .all(|u| u.skip_reason == Some(SkipReason::DuplicateInBatch)));
    for unit in result
        .succeeded
        .iter()
        .chain(&result.failed)
        .chain(&result.skipped)
    {
        assert!(unit.is_terminal());
    }
}

#[tokio::test]
async fn test_concurrent_batches_process_shared_key_once() {
    let (app, _store) = app_with(test_config(2), &[]);
    let app = Arc::new(app);

    let shared_calls = Arc::new(AtomicUsize::new(0));
    let counter = shared_calls.clone();
    let processor: Arc<dyn enrich_dispatch::Processor> =
        Arc::new(FnProcessor::new(move |ctx: UnitCtx, _payload: JsonValue| {
            let counter = counter.clone();
            async move {
                if ctx.key == "shared.com" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!(null))
            }
        }));

    let batch_a = vec!["shared.com".to_string(), "a1.com".to_string()];
    let batch_b = vec!["b1.com".to_string(), "shared.com".to_string()];
    let (a, b) = tokio::join!(
        app.run(units(&batch_a), processor.clone()),
        app.run(units(&batch_b), processor.clone())
    );

    assert_eq!(shared_calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.total() + b.total(), 4);
    let skipped: Vec<_> = a.skipped.iter().chain(&b.skipped).collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].key, "shared.com");
    assert!(matches!(
        skipped[0].skip_reason,
        Some(SkipReason::InFlightElsewhere) | Some(SkipReason::AlreadyProcessed)
    ));
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let seen: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink = Arc::new(move |snapshot: &ProgressSnapshot| {
        sink_seen.lock().unwrap().push(snapshot.clone());
    });

    let processed = keys(5);
    let app = App::with_progress(
        test_config(4),
        Arc::new(MemoryCacheBackend::new()),
        Arc::new(MemoryDedupStore::with_keys(processed)),
        sink,
    )
    .unwrap();

    let processor = FnProcessor::new(|_ctx: UnitCtx, _payload: JsonValue| async {
        Ok(json!(null))
    });
    app.run(units(&keys(20)), Arc::new(processor)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    for (i, snapshot) in seen.iter().enumerate() {
        assert_eq!(snapshot.processed, i + 1);
        assert_eq!(snapshot.total, 20);
        assert_eq!(
            snapshot.processed,
            snapshot.succeeded + snapshot.failed + snapshot.skipped
        );
    }
    let last = seen.last().unwrap();
    assert_eq!(last.succeeded, 15);
    assert_eq!(last.skipped, 5);
    assert_eq!(last.percent(), 100.0);
}

#[tokio::test]
async fn test_memory_byte_budget_under_concurrent_writes() {
    let mut config = test_config(8);
    config.cache.max_bytes = 1024 * 1024;
    let (app, _store) = app_with(config, &[]);

    let processor = FnProcessor::new(|ctx: UnitCtx, _payload: JsonValue| async move {
        let key = ctx.cache_key("html");
        ctx.cache
            .set(&key, vec![b'x'; 64 * 1024], Duration::from_secs(600))
            .await;
        Ok(json!(key))
    });

    // 32 × 64 KB = 2 MB
    let result = app.run(units(&keys(32)), Arc::new(processor)).await;
    assert_eq!(result.succeeded.len(), 32);

    let stats = app.cache().stats();
    assert!(stats.bytes_used <= 1024 * 1024);
    assert_eq!(stats.evictions, 16);

    // 被淘汰的条目仍可从持久层读回
    for key in keys(32) {
        let cached = app.cache().get(&format!("{}:html", key)).await;
        assert_eq!(cached.map(|v| v.len()), Some(64 * 1024));
    }
    assert!(app.cache().stats().bytes_used <= 1024 * 1024);
}

#[tokio::test(start_paused = true)]
async fn test_paced_service_spacing_across_workers() {
    let mut config = test_config(4);
    config.scheduler.paced_services = vec!["crm".to_string()];
    config.rate_limits.default_limit.min_interval = Duration::from_millis(50);
    let (app, _store) = app_with(config, &[]);

    let calls: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = calls.clone();
    let processor = FnProcessor::new(move |_ctx: UnitCtx, _payload: JsonValue| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().unwrap().push(tokio::time::Instant::now());
            Ok(json!(null))
        }
    });

    let result = app.run(units(&keys(12)), Arc::new(processor)).await;
    assert_eq!(result.succeeded.len(), 12);

    let mut calls = calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(calls.len(), 12);
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(50));
    }
}

#[tokio::test]
async fn test_unit_timeout_fails_as_transient() {
    let mut config = test_config(2);
    config.scheduler.unit_timeout = Duration::from_millis(20);
    config.isolator.max_retries = 1;
    let (app, _store) = app_with(config, &[]);

    let processor = FnProcessor::new(|_ctx: UnitCtx, _payload: JsonValue| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    });

    let result = app
        .run(units(&["hang.com".to_string()]), Arc::new(processor))
        .await;

    assert_eq!(result.failed.len(), 1);
    let unit = &result.failed[0];
    assert_eq!(unit.attempts, 2);
    assert_eq!(unit.error.as_ref().map(|e| e.kind), Some(ErrorKind::Transient));
}

#[tokio::test]
async fn test_run_to_target_collects_new_keys() {
    let all = keys(40);
    // 前 20 个已处理
    let (app, _store) = app_with(test_config(4), &all[..20]);
    let mut source = StaticCandidateSource::new(all.clone());

    let processor = FnProcessor::new(|_ctx: UnitCtx, payload: JsonValue| async move {
        Ok(json!({ "seen": payload["domain"] }))
    });

    let run = app
        .run_to_target(
            &mut source,
            8,
            |key| json!({ "domain": key }),
            Arc::new(processor),
        )
        .await;

    assert_eq!(run.intake.stop_reason, StopReason::TargetReached);
    assert_eq!(run.intake.keys.len(), 8);
    assert_eq!(run.batch.succeeded.len(), 8);
    assert!(run.batch.skipped.is_empty());
    assert!(run
        .batch
        .succeeded
        .iter()
        .all(|u| !all[..20].contains(&u.key)));
    assert_eq!(
        run.batch.succeeded[0].output.as_ref().map(|o| o["seen"].is_string()),
        Some(true)
    );
}

#[tokio::test]
async fn test_empty_batch() {
    let (app, _store) = app_with(test_config(4), &[]);
    let processor = FnProcessor::new(|_ctx: UnitCtx, _payload: JsonValue| async {
        Ok(json!(null))
    });

    let result = app.run(Vec::new(), Arc::new(processor)).await;
    assert_eq!(result.total(), 0);
}
