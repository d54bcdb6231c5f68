//! 进度快照与批次结果

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::work_unit::{UnitStatus, WorkUnit};

/// 每个单元进入终态后发出的进度快照（不可变值）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 刚刚完成的单元
    pub current_key: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// 完成百分比
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 / self.total as f64 * 100.0
        }
    }
}

/// 批次处理结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: Vec<WorkUnit>,
    pub failed: Vec<WorkUnit>,
    pub skipped: Vec<WorkUnit>,
    pub duration: Duration,
}

impl BatchResult {
    /// 按终态归档一个单元
    pub(crate) fn record(&mut self, unit: WorkUnit) {
        match unit.status {
            UnitStatus::Succeeded => self.succeeded.push(unit),
            UnitStatus::Failed => self.failed.push(unit),
            _ => self.skipped.push(unit),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// 所有失败单元的 (key, 错误信息)
    pub fn failure_messages(&self) -> Vec<(String, String)> {
        self.failed
            .iter()
            .map(|u| {
                let message = u
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                (u.key.clone(), message)
            })
            .collect()
    }
}
