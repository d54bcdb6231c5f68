//! 工作单元
//!
//! 一个工作单元 = 一条待处理的独立记录（例如一家待补全信息的公司）。
//! 引擎只认识 `key`，`payload` / `output` 对引擎不透明。

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult, ClassifiedError};

/// 工作单元状态
///
/// 迁移只允许向前：
/// `Pending → Skipped`、`Pending → InProgress → Succeeded | Failed`。
/// 重试发生在 `InProgress` 内部，不回到 `Pending`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl UnitStatus {
    /// 是否允许从 self 迁移到 `to`
    pub fn can_transition_to(self, to: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress) | (Pending, Skipped) | (InProgress, Succeeded) | (InProgress, Failed)
        )
    }

    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Skipped
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Failed => "failed",
            UnitStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 之前的运行已经处理过
    AlreadyProcessed,
    /// 批次被取消时尚未派发
    Cancelled,
    /// 同一批次中重复出现的 key
    DuplicateInBatch,
    /// 同一个 key 正在另一批次中处理
    InFlightElsewhere,
}

/// 一个工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// 唯一标识（去重依据）
    pub key: String,

    /// 交给 Processor 的参数，引擎不解释
    pub payload: JsonValue,

    /// 当前状态
    pub status: UnitStatus,

    /// 已调用 Processor 的次数
    pub attempts: u32,

    /// 跳过时的原因
    pub skip_reason: Option<SkipReason>,

    /// 失败时的分类错误
    pub error: Option<ClassifiedError>,

    /// 成功时 Processor 的返回值
    pub output: Option<JsonValue>,
}

impl WorkUnit {
    /// 创建待处理单元
    pub fn new(key: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            key: key.into(),
            payload,
            status: UnitStatus::Pending,
            attempts: 0,
            skip_reason: None,
            error: None,
            output: None,
        }
    }

    /// 状态迁移，拒绝任何倒退
    pub fn transition(&mut self, to: UnitStatus) -> AppResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> AppResult<()> {
        self.transition(UnitStatus::InProgress)
    }

    pub fn skip(&mut self, reason: SkipReason) -> AppResult<()> {
        self.transition(UnitStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    pub fn succeed(&mut self, output: JsonValue, attempts: u32) -> AppResult<()> {
        self.transition(UnitStatus::Succeeded)?;
        self.output = Some(output);
        self.attempts = attempts;
        Ok(())
    }

    pub fn fail(&mut self, error: ClassifiedError, attempts: u32) -> AppResult<()> {
        self.transition(UnitStatus::Failed)?;
        self.error = Some(error);
        self.attempts = attempts;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
