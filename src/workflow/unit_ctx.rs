//! 单元处理上下文
//!
//! 封装"我正在处理哪个单元的第几次尝试"，并携带共享的限速器与缓存句柄

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use crate::error::UnitError;
use crate::services::{RateLimiter, TieredCache};

/// 单元处理上下文
///
/// 每次尝试新建一个，克隆成本只有两个 Arc
#[derive(Clone)]
pub struct UnitCtx {
    /// 工作单元 key
    pub key: String,

    /// 在批次中的序号（从1开始，仅用于日志显示）
    pub index: usize,

    /// 第几次尝试（从1开始）
    pub attempt: u32,

    pub rate_limiter: Arc<RateLimiter>,

    pub cache: Arc<TieredCache>,
}

impl UnitCtx {
    pub fn new(
        key: impl Into<String>,
        index: usize,
        attempt: u32,
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
    ) -> Self {
        Self {
            key: key.into(),
            index,
            attempt,
            rate_limiter,
            cache,
        }
    }

    /// 对 `service` 限速后执行调用，并把结果回报给限速器
    pub async fn paced<T, Fut>(&self, service: &str, call: Fut) -> Result<T, UnitError>
    where
        Fut: Future<Output = Result<T, UnitError>>,
    {
        self.rate_limiter.paced(service, call).await
    }

    /// 本单元专属的缓存 key
    pub fn cache_key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key, suffix)
    }
}

impl Display for UnitCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[单元 #{} {} 尝试#{}]",
            self.index, self.key, self.attempt
        )
    }
}

impl std::fmt::Debug for UnitCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitCtx")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("attempt", &self.attempt)
            .finish()
    }
}
