//! # Enrich Dispatch
//!
//! 并发工作单元处理引擎：把一批互相独立、需要调用外部服务的记录
//! 分发到有界工作池，按服务限速，两级缓存中间结果，跳过已处理的记录。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持久后端，只暴露读写能力
//! - `CacheBackend` - 持久缓存（进程内 / 一个 key 一个文件）
//! - `DedupStore` - 已处理记录（进程内 / JSON Lines 追加写）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，互不依赖
//! - `RateLimiter` - 按服务限速与自适应退避
//! - `TieredCache` - 内存 + 持久两级缓存
//! - `DeduplicationIndex` - 已处理快照与动态拉取
//! - `ErrorIsolator` - 错误分类、重试、panic 隔离
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个单元"的完整处理流程
//! - `UnitCtx` - 上下文封装（key + 尝试序号 + 共享服务）
//! - `UnitFlow` - 流程编排（去重 → 限速 → 超时调用 → 重试 → 终态）
//! - `Processor` / `StrategyChain` - 调用方的业务逻辑接入点
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 根据配置组装所有共享服务
//! - `orchestrator/work_scheduler` - 批次调度、取消、进度、结果汇总
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ClassifiedError, ErrorKind, UnitError};
pub use infrastructure::{
    CacheBackend, DedupStore, FileCacheBackend, JsonlDedupStore, MemoryCacheBackend,
    MemoryDedupStore,
};
pub use models::{
    BatchResult, CacheEntry, CacheTier, DedupRecord, ProgressSnapshot, RateLimitState, SkipReason,
    UnitStatus, WorkUnit,
};
pub use orchestrator::{
    App, CancelHandle, LoggingProgressSink, ProgressSink, SchedulerConfig, TargetRun, WorkScheduler,
};
pub use services::{
    BackoffPolicy, CacheConfig, CacheStats, CandidateSource, DedupConfig, DeduplicationIndex,
    ErrorIsolator, IntakeConfig, IntakeReport, IsolatorConfig, RateLimiter, RateLimiterConfig,
    ServiceLimit, StaticCandidateSource, StopReason, TieredCache, UnitOutcome, WarmEntry,
    WarmReport,
};
pub use workflow::{FnProcessor, Processor, Strategy, StrategyChain, StrategyHit, UnitCtx, UnitFlow};
