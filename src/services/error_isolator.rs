//! 错误隔离服务 - 业务能力层
//!
//! 包裹单个工作单元的一次处理调用：分类错误、按策略重试、捕获 panic，
//! 永远返回终态结果，不向上抛出。
//!
//! ## 分类
//!
//! - Transient（超时、连接错误、限流）：最多重试 `max_retries` 次，指数退避 + 抖动
//! - Permanent（校验失败、不存在、panic）：不重试
//! - Unknown：重试 `unknown_retries` 次（默认 1），之后按 Permanent 处理

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ClassifiedError, ConfigError, ErrorKind, UnitError};
use crate::services::backoff::BackoffPolicy;

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolatorConfig {
    /// 首次调用之外最多重试几次
    pub max_retries: u32,
    /// Unknown 错误允许的重试次数
    pub unknown_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unknown_retries: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl IsolatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate("isolator.backoff")
    }
}

/// 一次隔离执行的终态结果
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: ClassifiedError, attempts: u32 },
}

impl<T> UnitOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            UnitOutcome::Succeeded { attempts, .. } | UnitOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }

    pub fn into_result(self) -> Result<T, ClassifiedError> {
        match self {
            UnitOutcome::Succeeded { value, .. } => Ok(value),
            UnitOutcome::Failed { error, .. } => Err(error),
        }
    }
}

/// 错误隔离服务
pub struct ErrorIsolator {
    config: IsolatorConfig,
}

impl ErrorIsolator {
    pub fn new(config: IsolatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IsolatorConfig {
        &self.config
    }

    /// 执行 `operation`，参数为从 1 开始的尝试序号
    ///
    /// # 返回
    /// 总是返回 `UnitOutcome`；operation 内部的 panic 被捕获并记为 Permanent 失败
    pub async fn run<T, F, Fut>(&self, key: &str, mut operation: F) -> UnitOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UnitError>>,
    {
        let mut attempt: u32 = 0;
        let mut unknown_seen: u32 = 0;

        loop {
            attempt += 1;

            let result = match std::panic::catch_unwind(AssertUnwindSafe(|| operation(attempt))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            let err = match result {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!("[单元 {}] 第{}次尝试成功", key, attempt);
                    }
                    return UnitOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Ok(Err(err)) => err,
                Err(panic) => {
                    let message = format!("处理过程 panic: {}", panic_message(panic.as_ref()));
                    error!("[单元 {}] {}", key, message);
                    return UnitOutcome::Failed {
                        error: ClassifiedError::new(ErrorKind::Permanent, message),
                        attempts: attempt,
                    };
                }
            };

            let retries_used = attempt - 1;
            let kind = err.kind();
            let should_retry = match kind {
                ErrorKind::Transient => retries_used < self.config.max_retries,
                ErrorKind::Unknown => {
                    unknown_seen += 1;
                    unknown_seen <= self.config.unknown_retries
                }
                ErrorKind::Permanent => false,
            };

            if !should_retry {
                // Unknown 用完重试机会后视为 Permanent
                let final_kind = match kind {
                    ErrorKind::Unknown => ErrorKind::Permanent,
                    other => other,
                };
                warn!(
                    "[单元 {}] 放弃，共尝试 {} 次 ({}): {}",
                    key, attempt, final_kind, err
                );
                return UnitOutcome::Failed {
                    error: ClassifiedError::new(final_kind, err.to_string()),
                    attempts: attempt,
                };
            }

            let mut delay = self.config.backoff.jittered_delay_for(attempt);
            if let UnitError::RateLimited {
                retry_after: Some(retry_after),
                ..
            } = &err
            {
                delay = delay.max(*retry_after);
            }

            warn!(
                "[单元 {}] 第{}次尝试失败 ({}): {}，{:?} 后重试",
                key, attempt, kind, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn isolator(max_retries: u32) -> ErrorIsolator {
        ErrorIsolator::new(IsolatorConfig {
            max_retries,
            unknown_retries: 1,
            backoff: BackoffPolicy::new(
                Duration::from_millis(10),
                2.0,
                Duration::from_millis(100),
            ),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = isolator(3)
            .run("acme.com", |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UnitError::transient("connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(
            outcome,
            UnitOutcome::Succeeded {
                value: "done",
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_retries() {
        let outcome: UnitOutcome<()> = isolator(2)
            .run("acme.com", |_| async { Err(UnitError::Timeout(Duration::from_secs(1))) })
            .await;

        match outcome {
            UnitOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(error.kind, ErrorKind::Transient);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let outcome: UnitOutcome<()> = isolator(5)
            .run("bad", |_| async { Err(UnitError::validation("missing domain")) })
            .await;

        assert_eq!(outcome.attempts(), 1);
        let error = outcome.into_result().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert!(error.message.contains("missing domain"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_retried_once_then_permanent() {
        let outcome: UnitOutcome<()> = isolator(5)
            .run("odd", |_| async { Err(UnitError::Unknown("weird".into())) })
            .await;

        assert_eq!(outcome.attempts(), 2);
        assert_eq!(outcome.into_result().unwrap_err().kind, ErrorKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_captured() {
        let outcome: UnitOutcome<()> = isolator(3)
            .run("boom", |attempt| async move {
                if attempt > 0 {
                    panic!("processor exploded");
                }
                Ok(())
            })
            .await;

        let error = outcome.into_result().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert!(error.message.contains("processor exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_extends_delay() {
        let start = tokio::time::Instant::now();
        let outcome = isolator(1)
            .run("crm", |attempt| async move {
                if attempt == 1 {
                    Err(UnitError::rate_limited("crm", Some(Duration::from_secs(5))))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert!(outcome.is_success());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_anyhow_errors_are_classified() {
        let outcome: UnitOutcome<()> = isolator(3)
            .run("io", |_| async {
                let err = anyhow::Error::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such record",
                ));
                Err(UnitError::from(err))
            })
            .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap_err().kind, ErrorKind::Permanent);
    }
}
