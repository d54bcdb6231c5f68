//! 持久缓存后端 - 基础设施层
//!
//! 只暴露"按 key 读写"的能力，不关心 LRU / 晋升 / 失效策略（那些属于 TieredCache）。
//!
//! 提供两种实现：
//! - `MemoryCacheBackend`：进程内，可模拟后端不可达（测试用）
//! - `FileCacheBackend`：一个 key 一个 JSON 文件；长 key 用哈希命名，原 key 存在条目里

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CacheBackendError;
use crate::models::{CacheEntry, CacheTier};

/// 持久缓存后端
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// 读取条目（不做过期判断，由调用方负责）
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheBackendError>;

    /// 写入条目，创建时间取当前时间
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheBackendError>;

    /// 删除条目，返回是否存在
    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError>;

    /// 列出所有 key（失效与清扫使用）
    async fn keys(&self) -> Result<Vec<String>, CacheBackendError>;
}

// ========== 进程内实现 ==========

/// 进程内持久层
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
    available: AtomicBool,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟后端宕机 / 恢复
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 直接写入一条带指定创建时间的条目（测试构造过期数据用）
    pub fn insert_raw(&self, entry: CacheEntry) {
        self.lock().insert(entry.key.clone(), entry);
    }

    fn check_available(&self) -> Result<(), CacheBackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheBackendError::Unavailable(
                "memory backend switched off".to_string(),
            ))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheBackendError> {
        self.check_available()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheBackendError> {
        self.check_available()?;
        let entry = CacheEntry::new(key, value, ttl, CacheTier::Persistent);
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
        self.check_available()?;
        Ok(self.lock().remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheBackendError> {
        self.check_available()?;
        Ok(self.lock().keys().cloned().collect())
    }
}

// ========== 文件实现 ==========

/// 文件持久层：`<dir>/<hex(key)>.json`，长 key 为 `<dir>/h_<sha256(key)>.json`
pub struct FileCacheBackend {
    dir: PathBuf,
}

impl FileCacheBackend {
    /// 打开（必要时创建）缓存目录
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CacheBackendError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| io_error(&dir, source))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheBackendError> {
        let path = self.path_for(key);
        let entry = match read_entry(&path).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        // 哈希命名的文件要核对原 key
        if entry.key != key {
            warn!("缓存文件 {} 属于另一个 key，忽略", path.display());
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheBackendError> {
        let entry = CacheEntry::new(key, value, ttl, CacheTier::Persistent);
        let bytes = serde_json::to_vec(&entry)?;

        // 先写临时文件再 rename，读者不会看到写了一半的条目
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp{}", rand::random::<u32>()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(&path, source))?;

        debug!("缓存文件已写入: {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheBackendError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| io_error(&self.dir, source))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.dir, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with(HASHED_PREFIX) {
                match read_entry(&path).await {
                    Ok(Some(entry)) => keys.push(entry.key),
                    Ok(None) => {}
                    Err(e) => warn!("跳过无法读取的缓存文件 {}: {}", path.display(), e),
                }
            } else if let Some(key) = decode_key(stem) {
                keys.push(key);
            }
        }

        Ok(keys)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheBackendError {
    CacheBackendError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// 超过这个长度的 key 改用哈希命名，十六进制文件名不超过文件系统的 255 字节限制
const MAX_HEX_KEY_BYTES: usize = 100;

/// 哈希文件名前缀，`_` 不会出现在十六进制编码里
const HASHED_PREFIX: &str = "h_";

/// key 可能含有 `/`、`:` 等字符，短 key 编码为小写十六进制，长 key 取 SHA-256
fn encode_key(key: &str) -> String {
    if key.len() <= MAX_HEX_KEY_BYTES {
        hex::encode(key)
    } else {
        format!("{}{}", HASHED_PREFIX, hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheBackendError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path, source)),
    }
}
