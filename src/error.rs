//! 错误类型
//!
//! 按关注点划分：
//! - `UnitError`：Processor 返回给引擎的单元级错误
//! - `ClassifiedError` / `ErrorKind`：ErrorIsolator 分类后的结果
//! - `CacheBackendError`：持久缓存层错误（只记录日志，降级为 miss）
//! - `DedupStoreError`：去重存储错误（只记录日志，降级为"全部视为新"）
//! - `ConfigError`：构造期配置错误（唯一的致命错误）

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::UnitStatus;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 非法的状态迁移
    #[error("非法状态迁移 ({key}): {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    /// 缓存后端错误
    #[error("缓存后端错误: {0}")]
    Cache(#[from] CacheBackendError),

    /// 去重存储错误
    #[error("去重存储错误: {0}")]
    Dedup(#[from] DedupStoreError),

    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

// ========== 单元级错误 ==========

/// Processor 处理单个工作单元时返回的错误
///
/// 变体本身就携带了分类信息，ErrorIsolator 据此决定是否重试。
#[derive(Debug, Clone, Error)]
pub enum UnitError {
    /// 可重试的外部服务错误（连接重置、5xx 等）
    #[error("临时服务错误: {0}")]
    Transient(String),

    /// 外部服务明确返回了限流信号
    #[error("请求频率限制 ({service}), 建议等待: {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    /// 单次调用超时
    #[error("调用超时 ({0:?})")]
    Timeout(Duration),

    /// 输入不合法，重试没有意义
    #[error("校验失败: {0}")]
    Validation(String),

    /// 目标不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 无法分类的错误
    #[error("{0}")]
    Unknown(String),
}

impl UnitError {
    pub fn transient(message: impl Into<String>) -> Self {
        UnitError::Transient(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        UnitError::Validation(message.into())
    }

    pub fn rate_limited(service: impl Into<String>, retry_after: Option<Duration>) -> Self {
        UnitError::RateLimited {
            service: service.into(),
            retry_after,
        }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitError::Transient(_) | UnitError::RateLimited { .. } | UnitError::Timeout(_) => {
                ErrorKind::Transient
            }
            UnitError::Validation(_) | UnitError::NotFound(_) => ErrorKind::Permanent,
            UnitError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// 允许 Processor 直接用 `?` 传播 anyhow 错误
///
/// 能识别的底层错误（io 超时 / 连接类错误、tokio 超时）归为 Transient，其余为 Unknown。
impl From<anyhow::Error> for UnitError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(unit_err) = err.downcast_ref::<UnitError>() {
            return unit_err.clone();
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return UnitError::Transient(format!("{:#}", err));
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind as Io;
            return match io_err.kind() {
                Io::TimedOut
                | Io::ConnectionReset
                | Io::ConnectionRefused
                | Io::ConnectionAborted
                | Io::BrokenPipe
                | Io::Interrupted
                | Io::WouldBlock => UnitError::Transient(format!("{:#}", err)),
                Io::NotFound => UnitError::NotFound(format!("{:#}", err)),
                Io::InvalidInput | Io::InvalidData => UnitError::Validation(format!("{:#}", err)),
                _ => UnitError::Unknown(format!("{:#}", err)),
            };
        }
        UnitError::Unknown(format!("{:#}", err))
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 可重试
    Transient,
    /// 不可重试
    Permanent,
    /// 未知：重试一次，之后按 Permanent 处理
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// 分类后的失败信息，记录在 `BatchResult.failed` 的单元上
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{kind}] {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&UnitError> for ClassifiedError {
    fn from(err: &UnitError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

// ========== 后端错误 ==========

/// 持久缓存层错误
#[derive(Debug, Error)]
pub enum CacheBackendError {
    /// 后端不可达
    #[error("缓存后端不可用: {0}")]
    Unavailable(String),

    /// 读写失败
    #[error("缓存文件读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化失败
    #[error("缓存条目序列化失败: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 去重存储错误
#[derive(Debug, Error)]
pub enum DedupStoreError {
    /// 存储不可达
    #[error("去重存储不可用: {0}")]
    Unavailable(String),

    /// 读写失败
    #[error("去重文件读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 记录解析失败
    #[error("去重记录解析失败: {0}")]
    Serde(#[from] serde_json::Error),
}

// ========== 配置错误 ==========

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 字段取值非法
    #[error("配置项 {field} 非法: {reason}")]
    InvalidValue { field: String, reason: String },

    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },

    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// 读取配置文件失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
