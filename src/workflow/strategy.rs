//! 多策略兜底 - 流程层
//!
//! 按顺序尝试一组策略（例如：先查主数据源，再查备用源，最后用降级结果），
//! 第一个给出结果的策略胜出。每个策略都有独立的超时。
//!
//! 单个策略出错或超时只记日志并继续下一个；
//! 只有全部策略都出错（没有任何一个正常返回"没找到"）时才向上返回错误。

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::UnitError;

/// 一个策略
#[async_trait]
pub trait Strategy<I, O>: Send + Sync
where
    I: ?Sized + Sync,
    O: Send,
{
    /// 策略名称（日志用）
    fn name(&self) -> &str;

    /// 尝试给出结果；`Ok(None)` 表示正常地没找到
    async fn attempt(&self, input: &I) -> anyhow::Result<Option<O>>;
}

/// 命中的结果与命中的策略
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyHit<O> {
    pub value: O,
    pub strategy: String,
    /// 策略在链中的位置（从0开始）
    pub position: usize,
}

/// 有序策略链
pub struct StrategyChain<I: ?Sized + Sync, O: Send> {
    strategies: Vec<Box<dyn Strategy<I, O>>>,
    timeout: Duration,
}

impl<I, O> StrategyChain<I, O>
where
    I: ?Sized + Sync,
    O: Send,
{
    /// `timeout` 作用于每个策略
    pub fn new(timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            timeout,
        }
    }

    pub fn with(mut self, strategy: impl Strategy<I, O> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// 依次尝试，返回第一个命中
    pub async fn run(&self, label: &str, input: &I) -> Result<Option<StrategyHit<O>>, UnitError> {
        let mut last_error: Option<UnitError> = None;
        let mut clean_miss = false;

        for (position, strategy) in self.strategies.iter().enumerate() {
            debug!("{} 🔍 尝试策略 {}", label, strategy.name());

            match tokio::time::timeout(self.timeout, strategy.attempt(input)).await {
                Ok(Ok(Some(value))) => {
                    info!("{} ✓ 策略 {} 命中", label, strategy.name());
                    return Ok(Some(StrategyHit {
                        value,
                        strategy: strategy.name().to_string(),
                        position,
                    }));
                }
                Ok(Ok(None)) => {
                    debug!("{} 策略 {} 未找到结果", label, strategy.name());
                    clean_miss = true;
                }
                Ok(Err(e)) => {
                    warn!("{} ⚠️ 策略 {} 出错: {:#}", label, strategy.name(), e);
                    last_error = Some(UnitError::from(e));
                }
                Err(_) => {
                    warn!(
                        "{} ⚠️ 策略 {} 超时 ({:?})",
                        label,
                        strategy.name(),
                        self.timeout
                    );
                    last_error = Some(UnitError::Timeout(self.timeout));
                }
            }
        }

        match last_error {
            Some(e) if !clean_miss => Err(e),
            _ => {
                info!("{} 所有策略均未命中", label);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        answer: Option<&'static str>,
    }

    #[async_trait]
    impl Strategy<str, String> for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(&self, input: &str) -> anyhow::Result<Option<String>> {
            Ok(self.answer.map(|a| format!("{}:{}", input, a)))
        }
    }

    struct Broken;

    #[async_trait]
    impl Strategy<str, String> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn attempt(&self, _input: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("upstream 503")
        }
    }

    struct Slow;

    #[async_trait]
    impl Strategy<str, String> for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn attempt(&self, _input: &str) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some("late".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_hit_wins_after_failures() {
        let chain: StrategyChain<str, String> = StrategyChain::new(Duration::from_secs(1))
            .with(Broken)
            .with(Slow)
            .with(Fixed {
                name: "primary",
                answer: None,
            })
            .with(Fixed {
                name: "fallback",
                answer: Some("ok"),
            });

        let hit = chain.run("[test]", "acme").await.unwrap().unwrap();
        assert_eq!(hit.value, "acme:ok");
        assert_eq!(hit.strategy, "fallback");
        assert_eq!(hit.position, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_miss_is_none() {
        let chain: StrategyChain<str, String> = StrategyChain::new(Duration::from_secs(1))
            .with(Broken)
            .with(Fixed {
                name: "primary",
                answer: None,
            });

        assert_eq!(chain.run("[test]", "acme").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_errors_propagate_last() {
        let chain: StrategyChain<str, String> =
            StrategyChain::new(Duration::from_secs(1)).with(Broken).with(Slow);

        let err = chain.run("[test]", "acme").await.unwrap_err();
        assert!(matches!(err, UnitError::Timeout(_)));
    }
}
