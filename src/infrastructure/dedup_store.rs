//! 去重存储 - 基础设施层
//!
//! 持久化"哪些 key 已经处理过"。DeduplicationIndex 通过 `list_keys` 刷新内存快照，
//! 通过 `record` 异步追加新记录。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::DedupStoreError;
use crate::models::DedupRecord;

/// 去重存储
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// 列出在 `since` 之后处理过、且仍在保留期内的 key；`since` 为 None 表示全部
    async fn list_keys(&self, since: Option<DateTime<Utc>>) -> Result<Vec<String>, DedupStoreError>;

    /// 追加一条记录
    async fn record(&self, record: &DedupRecord) -> Result<(), DedupStoreError>;
}

fn is_listed(record: &DedupRecord, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    since.map_or(true, |since| record.processed_at >= since) && record.is_live_at(now)
}

// ========== 进程内实现 ==========

/// 进程内去重存储，可模拟不可达
pub struct MemoryDedupStore {
    records: Mutex<HashMap<String, DedupRecord>>,
    available: AtomicBool,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// 预置一批已处理的 key
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut records = store.lock();
            for key in keys {
                let record = DedupRecord::new(key);
                records.insert(record.key.clone(), record);
            }
        }
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), DedupStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DedupStoreError::Unavailable(
                "memory dedup store switched off".to_string(),
            ))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DedupRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn list_keys(&self, since: Option<DateTime<Utc>>) -> Result<Vec<String>, DedupStoreError> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .lock()
            .values()
            .filter(|r| is_listed(r, since, now))
            .map(|r| r.key.clone())
            .collect())
    }

    async fn record(&self, record: &DedupRecord) -> Result<(), DedupStoreError> {
        self.check_available()?;
        self.lock().insert(record.key.clone(), record.clone());
        Ok(())
    }
}

// ========== JSON Lines 文件实现 ==========

/// 追加写的 JSON Lines 文件，每行一条 `DedupRecord`
pub struct JsonlDedupStore {
    path: PathBuf,
    // 串行化追加写，避免并发写交错成半行
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlDedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> DedupStoreError {
        DedupStoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl DedupStore for JsonlDedupStore {
    async fn list_keys(&self, since: Option<DateTime<Utc>>) -> Result<Vec<String>, DedupStoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let now = Utc::now();
        let mut keys = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DedupRecord>(line) {
                Ok(record) if is_listed(&record, since, now) => keys.push(record.key),
                Ok(_) => {}
                // 崩溃时可能留下半行，跳过即可
                Err(e) => warn!(
                    "跳过无法解析的去重记录 ({}:{}): {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ),
            }
        }

        Ok(keys)
    }

    async fn record(&self, record: &DedupRecord) -> Result<(), DedupStoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        // 上次崩溃留下的半行必须先换行结束，否则会吞掉这条记录
        if !ends_with_newline(&mut file)
            .await
            .map_err(|e| self.io_error(e))?
        {
            warn!("去重文件末尾是半行，补换行后再追加: {}", self.path.display());
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        Ok(())
    }
}

/// 空文件视为以换行结尾
async fn ends_with_newline(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(std::io::SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_store_since_filter() {
        let store = MemoryDedupStore::new();
        let mut old = DedupRecord::new("old.com");
        old.processed_at = Utc::now() - chrono::Duration::days(30);
        store.record(&old).await.unwrap();
        store.record(&DedupRecord::new("new.com")).await.unwrap();

        let mut all = store.list_keys(None).await.unwrap();
        all.sort();
        assert_eq!(all, vec!["new.com", "old.com"]);

        let recent = store
            .list_keys(Some(Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(recent, vec!["new.com"]);
    }

    #[tokio::test]
    async fn test_expired_records_are_not_listed() {
        let store = MemoryDedupStore::new();
        let mut record = DedupRecord::new("stale.com");
        record.processed_at = Utc::now() - chrono::Duration::hours(2);
        record.ttl = Some(Duration::from_secs(3600));
        store.record(&record).await.unwrap();

        assert!(store.list_keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("processed.jsonl");
        let store = JsonlDedupStore::new(&path);

        assert!(store.list_keys(None).await.unwrap().is_empty());

        store.record(&DedupRecord::new("a.com")).await.unwrap();
        store.record(&DedupRecord::new("b.com")).await.unwrap();

        // 模拟崩溃留下的半行
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"key\": \"c.c").await.unwrap();
        file.flush().await.unwrap();

        let keys = store.list_keys(None).await.unwrap();
        assert_eq!(keys, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_jsonl_record_after_torn_line_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.jsonl");
        let store = JsonlDedupStore::new(&path);
        store.record(&DedupRecord::new("a.com")).await.unwrap();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"key\": \"c.c").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        store.record(&DedupRecord::new("d.com")).await.unwrap();
        store.record(&DedupRecord::new("e.com")).await.unwrap();

        let keys = store.list_keys(None).await.unwrap();
        assert_eq!(keys, vec!["a.com", "d.com", "e.com"]);
    }
}
