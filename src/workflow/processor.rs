//! 处理器接口
//!
//! 把一个工作单元变成结果的业务逻辑（抓取、生成、发送……）由调用方实现，
//! 引擎只通过这个 trait 调用它。

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::UnitError;
use crate::workflow::unit_ctx::UnitCtx;

/// 单元处理器
///
/// 实现方应当是幂等的：同一个 key 可能因重试被调用多次
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_unit(&self, ctx: &UnitCtx, payload: &JsonValue)
        -> Result<JsonValue, UnitError>;
}

/// 用闭包实现的处理器
///
/// 闭包拿到上下文和 payload 的副本，返回的 future 不借用任何东西
pub struct FnProcessor<F> {
    f: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(UnitCtx, JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, UnitError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(UnitCtx, JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, UnitError>> + Send,
{
    async fn process_unit(
        &self,
        ctx: &UnitCtx,
        payload: &JsonValue,
    ) -> Result<JsonValue, UnitError> {
        (self.f)(ctx.clone(), payload.clone()).await
    }
}
