//! 程序配置
//!
//! 配置来源（后者覆盖前者不做合并，调用方任选其一）：
//! - `Config::default()`
//! - `Config::from_env()`：环境变量，缺省值同 default
//! - `Config::load(path)` / `Config::from_toml_str()`：TOML 文件，时长字段以 `_ms` 结尾
//!
//! 所有入口都会调用 `validate()`，非法配置在派发任何工作之前就失败。

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::orchestrator::SchedulerConfig;
use crate::services::{CacheConfig, DedupConfig, IntakeConfig, IsolatorConfig, RateLimiterConfig};

/// 程序配置文件
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 工作池
    pub scheduler: SchedulerConfig,
    /// 各外部服务的限速参数
    pub rate_limits: RateLimiterConfig,
    /// 两级缓存
    pub cache: CacheConfig,
    /// 重试策略
    pub isolator: IsolatorConfig,
    /// 去重快照
    pub dedup: DedupConfig,
    /// 动态拉取候选
    pub intake: IntakeConfig,
    /// 日志级别（RUST_LOG 未设置时生效）
    pub log_level: Option<String>,
}

impl Config {
    /// 从环境变量加载
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.scheduler.worker_count = env_or("WORKER_COUNT", config.scheduler.worker_count)?;
        config.scheduler.unit_timeout = Duration::from_secs(env_or(
            "UNIT_TIMEOUT_SECS",
            config.scheduler.unit_timeout.as_secs(),
        )?);
        if let Ok(services) = std::env::var("PACED_SERVICES") {
            config.scheduler.paced_services = services
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.rate_limits.default_limit.min_interval = Duration::from_millis(env_or(
            "RATE_LIMIT_MIN_INTERVAL_MS",
            config.rate_limits.default_limit.min_interval.as_millis() as u64,
        )?);

        config.isolator.max_retries = env_or("MAX_RETRIES", config.isolator.max_retries)?;

        config.cache.max_entries = env_or("CACHE_MAX_ENTRIES", config.cache.max_entries)?;
        config.cache.max_bytes = env_or("CACHE_MAX_BYTES", config.cache.max_bytes)?;
        config.cache.default_ttl = Duration::from_secs(env_or(
            "CACHE_DEFAULT_TTL_SECS",
            config.cache.default_ttl.as_secs(),
        )?);

        config.dedup.refresh_ttl = Duration::from_secs(env_or(
            "DEDUP_REFRESH_SECS",
            config.dedup.refresh_ttl.as_secs(),
        )?);

        config.log_level = std::env::var("LOG_LEVEL").ok();

        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML 文本
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|source| ConfigError::TomlParseFailed {
                path: String::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::ReadFailed {
                    path: path.display().to_string(),
                    source,
                })?;

        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验所有子配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.rate_limits.validate()?;
        self.cache.validate()?;
        self.isolator.validate()?;
        self.dedup.validate()?;
        self.intake.validate()?;
        Ok(())
    }
}

/// 读取环境变量，不存在时返回默认值，存在但无法解析时报错
fn env_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
        Err(_) => Ok(default),
    }
}

/// 以毫秒整数序列化 `Duration`
pub(crate) mod serde_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// 以毫秒整数序列化 `Option<Duration>`
pub(crate) mod serde_opt_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
