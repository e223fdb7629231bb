//! The composed state store.
//!
//! Reads consult the cache, then queued writes, then disk. Writes update the
//! cache synchronously and are queued in the batcher; every physical write
//! goes through the lock protocol and an atomic rename.

use super::atomic::{atomic_write, read_optional, remove_optional};
use super::batch::{BatchConfig, BatchSink, BatchStats, WriteBatcher};
use super::cache::{CacheConfig, CacheStats, LruTtlCache};
use super::lock::{LockConfig, LockManager, LockStats};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for a [`StateStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory relative paths are resolved against.
    #[serde(default)]
    pub root: PathBuf,
    /// Read cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Write batching settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Locking settings.
    #[serde(default)]
    pub lock: LockConfig,
}

impl StoreConfig {
    /// Creates a configuration rooted at `root` with defaults.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration with cache, batching and locking all off.
    #[must_use]
    pub fn direct(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: CacheConfig::disabled(),
            batch: BatchConfig::disabled(),
            lock: LockConfig::disabled(),
        }
    }

    /// Sets the cache configuration.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the batch configuration.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the lock configuration.
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }
}

/// Combined metrics of a store's layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetrics {
    /// Cache counters, if the cache is enabled.
    pub cache: Option<CacheStats>,
    /// Batcher counters, if batching is enabled.
    pub batch: Option<BatchStats>,
    /// Lock counters.
    pub locks: LockStats,
}

impl StoreMetrics {
    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "cache_hit_rate": self.cache.map(|c| c.hit_rate),
            "coalescing_rate": self.batch.map(|b| b.coalescing_rate),
            "lock_contended": self.locks.contended,
            "lock_stolen": self.locks.stolen,
        })
    }
}

struct LockedWriter {
    locks: LockManager,
}

#[async_trait]
impl BatchSink for LockedWriter {
    async fn persist(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        self.locks
            .with_lock(path, || async { atomic_write(path, data) })
            .await
    }
}

/// File-backed key/value store with caching, batching and locking.
pub struct StateStore {
    root: PathBuf,
    cache: Option<LruTtlCache<Arc<[u8]>>>,
    batcher: Option<WriteBatcher>,
    writer: Arc<LockedWriter>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("root", &self.root)
            .field("cache", &self.cache.is_some())
            .field("batching", &self.batcher.is_some())
            .field("locking", &self.writer.locks.is_enabled())
            .finish()
    }
}

impl StateStore {
    /// Creates a store from configuration.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let writer = Arc::new(LockedWriter {
            locks: LockManager::new(config.lock.clone()),
        });
        let cache = config
            .cache
            .enabled
            .then(|| LruTtlCache::from_config(&config.cache));
        let batcher = config
            .batch
            .enabled
            .then(|| WriteBatcher::new(writer.clone(), &config.batch));

        debug!(
            root = %config.root.display(),
            cache = config.cache.enabled,
            batching = config.batch.enabled,
            locking = config.lock.enabled,
            "State store created"
        );

        Self {
            root: config.root,
            cache,
            batcher,
            writer,
            closed: AtomicBool::new(false),
        }
    }

    /// The directory relative paths resolve against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The holder id used for this store's locks.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        self.writer.locks.holder_id()
    }

    /// Resolves `path` against the root.
    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Reads raw bytes, or `None` if nothing is stored at `path`.
    pub async fn read_bytes(&self, path: impl AsRef<Path>) -> Result<Option<Arc<[u8]>>, StoreError> {
        let path = self.resolve(path);
        let key = cache_key(&path);

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
            return Ok(Some(hit));
        }
        if let Some(queued) = self.batcher.as_ref().and_then(|b| b.pending_value(&path)) {
            return Ok(Some(queued));
        }

        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let bytes: Arc<[u8]> = bytes.into();
        if let Some(cache) = &self.cache {
            cache.set(key, bytes.clone());
        }
        Ok(Some(bytes))
    }

    /// Writes raw bytes, queued if batching is enabled.
    pub async fn write_bytes(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let data = data.into();
        if let Some(cache) = &self.cache {
            cache.set(cache_key(&path), data.clone());
        }

        match &self.batcher {
            Some(batcher) => batcher.write(path, data).await.map(|_ticket| ()),
            None => self.writer.persist(&path, &data).await,
        }
    }

    /// Writes raw bytes to disk before returning, superseding any queued write.
    pub async fn write_bytes_immediate(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let data = data.into();
        if let Some(cache) = &self.cache {
            cache.set(cache_key(&path), data.clone());
        }

        match &self.batcher {
            Some(batcher) => batcher.write_immediate(&path, &data).await,
            None => self.writer.persist(&path, &data).await,
        }
    }

    /// Reads and decodes a JSON document.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<T>, StoreError> {
        let path = self.resolve(path);
        match self.read_bytes(&path).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| decode_error(&path, "json", &e)),
            None => Ok(None),
        }
    }

    /// Encodes and writes a JSON document.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.resolve(path);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| encode_error(&path, "json", &e))?;
        self.write_bytes(path, bytes).await
    }

    /// Encodes a JSON document and writes it to disk before returning.
    pub async fn write_json_immediate<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.resolve(path);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| encode_error(&path, "json", &e))?;
        self.write_bytes_immediate(path, bytes).await
    }

    /// Reads and decodes a YAML document.
    pub async fn read_yaml<T: DeserializeOwned>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<T>, StoreError> {
        let path = self.resolve(path);
        match self.read_bytes(&path).await? {
            Some(bytes) => serde_yaml::from_slice(&bytes)
                .map(Some)
                .map_err(|e| decode_error(&path, "yaml", &e)),
            None => Ok(None),
        }
    }

    /// Encodes and writes a YAML document.
    pub async fn write_yaml<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.resolve(path);
        let text = serde_yaml::to_string(value).map_err(|e| encode_error(&path, "yaml", &e))?;
        self.write_bytes(path, text.into_bytes()).await
    }

    /// Reads a markdown (UTF-8 text) document.
    pub async fn read_markdown(&self, path: impl AsRef<Path>) -> Result<Option<String>, StoreError> {
        let path = self.resolve(path);
        match self.read_bytes(&path).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .map(|text| Some(text.to_string()))
                .map_err(|e| decode_error(&path, "markdown", &e)),
            None => Ok(None),
        }
    }

    /// Writes a markdown document.
    pub async fn write_markdown(
        &self,
        path: impl AsRef<Path>,
        content: &str,
    ) -> Result<(), StoreError> {
        self.write_bytes(path, content.as_bytes()).await
    }

    /// Deletes `path` from every layer. Returns true if anything was removed.
    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let cached = self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.delete(&cache_key(&path)));
        let queued = self
            .batcher
            .as_ref()
            .is_some_and(|batcher| batcher.discard(&path));

        let on_disk = self
            .writer
            .locks
            .with_lock(&path, || async { remove_optional(&path) })
            .await?;
        Ok(cached || queued || on_disk)
    }

    /// Returns true if something is stored at `path`.
    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool, StoreError> {
        let path = self.resolve(path);
        if self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.peek(&cache_key(&path)).is_some())
        {
            return Ok(true);
        }
        if self
            .batcher
            .as_ref()
            .is_some_and(|b| b.pending_value(&path).is_some())
        {
            return Ok(true);
        }
        Ok(path.is_file())
    }

    /// Lists stored files directly under `dir`, optionally filtered by extension.
    ///
    /// Queued writes that have not reached disk yet are included. Lock, claim,
    /// generation and temporary files are not.
    pub async fn list(
        &self,
        dir: impl AsRef<Path>,
        extension: Option<&str>,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.resolve(dir);
        let mut found = Vec::new();

        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| StoreError::io("list", &dir, e))?;
                    let path = entry.path();
                    if path.is_file() {
                        found.push(path);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("list", &dir, e)),
        }

        if let Some(batcher) = &self.batcher {
            found.extend(
                batcher
                    .pending_paths()
                    .into_iter()
                    .filter(|p| p.parent() == Some(dir.as_path())),
            );
        }

        found.retain(|path| is_listable(path, extension));
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Flushes queued writes. Returns the number of physical writes.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        match &self.batcher {
            Some(batcher) => batcher.flush().await,
            None => Ok(0),
        }
    }

    /// Flushes queued writes and rejects further writes.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(batcher) = &self.batcher {
            batcher.close().await?;
        }
        info!(root = %self.root.display(), "State store closed");
        Ok(())
    }

    /// Returns the combined metrics of the cache, batcher and locks.
    #[must_use]
    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            cache: self.cache.as_ref().map(LruTtlCache::stats),
            batch: self.batcher.as_ref().map(WriteBatcher::stats),
            locks: self.writer.locks.stats(),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::BatcherClosed)
        } else {
            Ok(())
        }
    }
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn is_listable(path: &Path, extension: Option<&str>) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with(".lock") || name.contains(".lock.") {
        return false;
    }
    match extension {
        Some(ext) => path
            .extension()
            .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext.trim_start_matches('.'))),
        None => true,
    }
}

fn decode_error(path: &Path, format: &'static str, err: &dyn std::fmt::Display) -> StoreError {
    StoreError::Decode {
        path: path.to_path_buf(),
        format,
        reason: err.to_string(),
    }
}

fn encode_error(path: &Path, format: &'static str, err: &dyn std::fmt::Display) -> StoreError {
    StoreError::Encode {
        path: path.to_path_buf(),
        format,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lock::lock_path_for;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn manual_flush(root: &Path) -> StoreConfig {
        StoreConfig::new(root).with_batch(BatchConfig::default().with_flush_interval_ms(None))
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Plan {
        title: String,
        steps: Vec<String>,
    }

    #[tokio::test]
    async fn test_read_after_write_before_flush() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        store.write_json("state.json", &json!({"v": 1})).await.unwrap();
        let value: serde_json::Value = store.read_json("state.json").await.unwrap().unwrap();

        assert_eq!(value, json!({"v": 1}));
        assert!(!dir.path().join("state.json").exists());

        store.flush().await.unwrap();
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_read_after_write_without_cache() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()).with_cache(CacheConfig::disabled()));

        store.write_markdown("notes.md", "# Plan").await.unwrap();
        assert_eq!(
            store.read_markdown("notes.md").await.unwrap().as_deref(),
            Some("# Plan")
        );
    }

    #[tokio::test]
    async fn test_coalesced_writes_produce_one_physical_write() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        for i in 0..4 {
            store.write_json("status.json", &json!({"step": i})).await.unwrap();
        }
        assert_eq!(store.flush().await.unwrap(), 1);

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("status.json")).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"step": 3}));

        let batch = store.metrics().batch.unwrap();
        assert_eq!(batch.coalesced, 3);
        assert_eq!(batch.physical_writes, 1);
    }

    #[tokio::test]
    async fn test_flush_blocked_by_lock_is_retried() {
        let dir = TempDir::new().unwrap();
        let lock = LockConfig::new().with_max_attempts(2).with_retry_delay_ms(1);
        let store = StateStore::new(manual_flush(dir.path()).with_lock(lock.clone()));
        let target = dir.path().join("state.json");
        let other = LockManager::with_holder(lock, "other-process");
        other.acquire(&target).await.unwrap();

        store.write_json("state.json", &json!({"v": 1})).await.unwrap();
        let err = store.flush().await.unwrap_err();
        assert_eq!(err.kind(), "flush_failed");
        assert!(!target.exists());
        assert_eq!(store.metrics().batch.unwrap().pending, 1);
        let value: serde_json::Value = store.read_json("state.json").await.unwrap().unwrap();
        assert_eq!(value, json!({"v": 1}));

        other.release(&target).unwrap();
        assert_eq!(store.flush().await.unwrap(), 1);

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&target).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"v": 1}));
        let batch = store.metrics().batch.unwrap();
        assert_eq!(batch.pending, 0);
        assert_eq!(batch.requeued, 1);
    }

    #[tokio::test]
    async fn test_yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StoreConfig::direct(dir.path()));
        let plan = Plan {
            title: "Login".into(),
            steps: vec!["schema".into(), "api".into()],
        };

        store.write_yaml("plan.yaml", &plan).await.unwrap();
        let back: Plan = store.read_yaml("plan.yaml").await.unwrap().unwrap();
        assert_eq!(back, plan);
    }

    #[tokio::test]
    async fn test_corrupt_json_is_decode_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let store = StateStore::new(StoreConfig::direct(dir.path()));

        let err = store
            .read_json::<serde_json::Value>("bad.json")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[tokio::test]
    async fn test_physical_write_takes_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StoreConfig::new(dir.path()).with_batch(BatchConfig::disabled()));

        store.write_bytes("a.txt", b"x".to_vec()).await.unwrap();

        assert!(dir.path().join("a.txt").exists());
        assert!(!lock_path_for(&dir.path().join("a.txt")).exists());
        let locks = store.metrics().locks;
        assert_eq!(locks.acquired, 1);
        assert_eq!(locks.released, 1);
    }

    #[tokio::test]
    async fn test_delete_clears_every_layer() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        store.write_bytes("a.txt", b"x".to_vec()).await.unwrap();
        store.flush().await.unwrap();
        store.write_bytes("a.txt", b"y".to_vec()).await.unwrap();

        assert!(store.delete("a.txt").await.unwrap());
        assert!(store.read_bytes("a.txt").await.unwrap().is_none());
        assert!(!store.exists("a.txt").await.unwrap());
        assert!(!store.delete("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_and_includes_queued() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        store.write_bytes("sessions/a.json", b"{}".to_vec()).await.unwrap();
        store.flush().await.unwrap();
        store.write_bytes("sessions/b.json", b"{}".to_vec()).await.unwrap();
        store.write_bytes("sessions/notes.md", b"x".to_vec()).await.unwrap();
        std::fs::write(dir.path().join("sessions/a.json.lock"), b"{}").unwrap();
        std::fs::write(dir.path().join("sessions/a.json.lock.gen"), b"3").unwrap();

        let listed = store.list("sessions", Some("json")).await.unwrap();
        assert_eq!(
            listed,
            vec![
                dir.path().join("sessions/a.json"),
                dir.path().join("sessions/b.json"),
            ]
        );
        assert!(store.list("missing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_write_is_durable() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        store.write_json("s.json", &json!({"v": 1})).await.unwrap();
        store.write_json_immediate("s.json", &json!({"v": 2})).await.unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("s.json")).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"v": 2}));
        assert_eq!(store.metrics().batch.unwrap().superseded, 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        store.write_bytes("a.txt", b"x".to_vec()).await.unwrap();
        store.close().await.unwrap();

        assert!(dir.path().join("a.txt").exists());
        let err = store.write_bytes("a.txt", b"y".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), "batcher_closed");
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let store = StateStore::new(manual_flush(dir.path()));

        assert!(store.read_bytes("a.txt").await.unwrap().is_some());
        assert!(store.read_bytes("a.txt").await.unwrap().is_some());

        let cache = store.metrics().cache.unwrap();
        assert_eq!(cache.misses, 1);
        assert_eq!(cache.hits, 1);
    }
}
