//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和并发调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用组装
//! - 根据 Config 构造共享服务（RateLimiter、TieredCache、DeduplicationIndex）
//! - 选择持久后端（进程内 / 文件）
//! - 管理缓存清扫任务的生命周期
//!
//! ### `work_scheduler` - 工作调度器
//! - 批内去重、跨批次占用检查
//! - 有界工作池（JoinSet），协作式取消
//! - 汇总 BatchResult，发出进度
//!
//! ### `progress` - 进度回调
//!
//! ## 层次关系
//!
//! ```text
//! app (组装 + 生命周期)
//!     ↓
//! work_scheduler (处理 Vec<WorkUnit>)
//!     ↓
//! workflow::UnitFlow (处理单个 WorkUnit)
//!     ↓
//! services (能力层：限速 / 缓存 / 去重 / 隔离)
//!     ↓
//! infrastructure (持久后端)
//! ```

pub mod app;
pub mod progress;
pub mod work_scheduler;

// 重新导出主要类型
pub use app::App;
pub use progress::{LoggingProgressSink, ProgressSink};
pub use work_scheduler::{CancelHandle, SchedulerConfig, TargetRun, WorkScheduler};
