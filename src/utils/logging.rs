//! 日志工具模块
//!
//! 提供日志初始化和批次级输出的辅助函数

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::BatchResult;

/// 默认日志级别
const DEFAULT_LEVEL: &str = "info";

/// 初始化 tracing 订阅者
///
/// 优先使用 `RUST_LOG`，未设置时使用 info。重复调用不会报错。
pub fn init() {
    init_with_level(None);
}

/// 初始化 tracing 订阅者
///
/// # 参数
/// - `level`: `RUST_LOG` 未设置时使用的级别（通常来自 `Config.log_level`）
pub fn init_with_level(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(DEFAULT_LEVEL)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录批次开始信息
///
/// # 参数
/// - `total`: 本批单元数
/// - `worker_count`: 实际启动的 worker 数
pub fn log_batch_start(total: usize, worker_count: usize) {
    info!("{}", "=".repeat(60));
    info!("📦 开始处理批次: {} 个单元", total);
    info!("📊 worker 数: {}", worker_count);
    info!("{}", "=".repeat(60));
}

/// 记录批次完成信息
///
/// # 参数
/// - `result`: 批次结果
pub fn log_batch_complete(result: &BatchResult) {
    info!("{}", "─".repeat(60));
    info!(
        "✓ 批次完成: 成功 {}/{}, 失败 {}, 跳过 {}, 耗时 {:.2}s",
        result.succeeded.len(),
        result.total(),
        result.failed.len(),
        result.skipped.len(),
        result.duration.as_secs_f64()
    );
    for (key, message) in result.failure_messages() {
        info!("  ❌ {}: {}", truncate_text(&key, 40), message);
    }
    info!("{}", "─".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（按字符计）
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("acme.com", 20), "acme.com");
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("公司名称很长", 2), "公司...");
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_level(Some("debug"));
    }
}
