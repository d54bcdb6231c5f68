//! 进度回调

use tracing::info;

use crate::models::ProgressSnapshot;
use crate::utils::logging::truncate_text;

/// 进度接收方
///
/// 每个单元进入终态后调用一次；调用按 `processed` 递增的顺序发生
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// 通过 tracing 输出进度
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        info!(
            "📊 进度 {}/{} ({:.1}%) ✅ {} ❌ {} ⏭ {} {}",
            snapshot.processed,
            snapshot.total,
            snapshot.percent(),
            snapshot.succeeded,
            snapshot.failed,
            snapshot.skipped,
            snapshot
                .current_key
                .as_deref()
                .map(|k| truncate_text(k, 40))
                .unwrap_or_default()
        );
    }
}
