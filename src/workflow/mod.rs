//! 流程层（Workflow）
//!
//! 定义"一个工作单元"从派发到终态的完整流程，不关心批次与并发：
//!
//! - `Processor` - 调用方实现的业务处理接口
//! - `UnitCtx` - 上下文封装（key + 尝试序号 + 共享服务句柄）
//! - `UnitFlow` - 流程编排（去重 → 限速 → 超时调用 → 重试 → 终态）
//! - `StrategyChain` - 有序多策略兜底，供 Processor 内部使用

pub mod processor;
pub mod strategy;
pub mod unit_ctx;
pub mod unit_flow;

pub use processor::{FnProcessor, Processor};
pub use strategy::{Strategy, StrategyChain, StrategyHit};
pub use unit_ctx::UnitCtx;
pub use unit_flow::UnitFlow;
