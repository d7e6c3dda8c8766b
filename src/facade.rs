//! Thin composition layer over the memory and disk engines.
//!
//! `Cache<T>` reads through memory first, promoting disk hits; writes fan
//! out to both tiers; trims and counts are each tier's own job, with count
//! and cost aggregates deferring to disk as the authoritative source. This
//! module is intentionally small, the hard engineering lives in
//! [`crate::memory`] and [`crate::disk`].

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex as PlMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::disk::DiskCache;
use crate::error::{Error, Result};
use crate::filename::FilenameCallback;
use crate::item::{Entry, StorageItem, StorageType};
use crate::memory::MemoryCache;
use crate::platform;

/// Process-wide path -> weak handle table, shared by every cache instance
/// so a second `open` of the same path returns the existing instance
/// instead of a competing one. Values are type-erased because the registry
/// is shared across every `Cache<T>` instantiation in the process.
static INSTANCES: Lazy<PlMutex<HashMap<PathBuf, Box<dyn Any + Send + Sync>>>> =
    Lazy::new(|| PlMutex::new(HashMap::new()));

fn intern_lookup<T: Send + Sync + 'static>(path: &Path) -> Option<Arc<Cache<T>>> {
    let registry = INSTANCES.lock();
    registry
        .get(path)
        .and_then(|any| any.downcast_ref::<Weak<Cache<T>>>())
        .and_then(Weak::upgrade)
}

fn intern_register<T: Send + Sync + 'static>(path: PathBuf, cache: &Arc<Cache<T>>) {
    INSTANCES.lock().insert(path, Box::new(Arc::downgrade(cache)));
}

fn intern_forget(path: &Path) {
    INSTANCES.lock().remove(path);
}

pub struct Cache<T> {
    path: PathBuf,
    memory: Arc<MemoryCache<Entry<T>>>,
    disk: Arc<DiskCache>,
    archive: Box<dyn Fn(&T) -> Result<Vec<u8>> + Send + Sync>,
    unarchive: Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>,
    storage_type: StorageType,
    inline_threshold: u64,
    filename_callback: FilenameCallback,
    free_disk_space_limit: u64,
    trim_interval: Duration,
    shutdown: Arc<Notify>,
    trim_handle: PlMutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Cache<T> {
    /// Opens (or returns the existing interned instance for) the cache at
    /// `path`. A second call with the same canonicalized path returns the
    /// same `Arc` rather than opening a competing disk engine.
    pub fn open(path: impl AsRef<Path>, config: CacheConfig<T>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path.as_ref())?;
        let normalized = std::fs::canonicalize(path.as_ref())?;

        if let Some(existing) = intern_lookup::<T>(&normalized) {
            return Ok(existing);
        }

        let storage_type = config.disk.storage_type;
        let inline_threshold = config.disk.inline_threshold;
        let filename_callback = config.disk.filename_callback.clone();
        let trim_interval = config.disk.auto_trim_interval;
        let free_disk_space_limit = config.free_disk_space_limit;

        let memory = MemoryCache::new(config.memory);
        let disk = DiskCache::open(&normalized, config.disk)?;

        let cache = Arc::new(Self {
            path: normalized.clone(),
            memory,
            disk,
            archive: config.archive,
            unarchive: config.unarchive,
            storage_type,
            inline_threshold,
            filename_callback,
            free_disk_space_limit,
            trim_interval,
            shutdown: Arc::new(Notify::new()),
            trim_handle: PlMutex::new(None),
        });
        let handle = spawn_free_space_timer(cache.clone());
        *cache.trim_handle.lock() = Some(handle);
        intern_register(normalized, &cache);
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decides whether a newly-encoded value of `encoded_len` bytes is
    /// stored inline or external, per `inline_threshold`.
    fn route_filename(&self, key: &str, encoded_len: u64) -> Option<String> {
        match self.storage_type {
            StorageType::Sqlite => None,
            StorageType::File => Some(self.filename_callback.filename_for_key(key)),
            StorageType::Mixed => {
                if encoded_len <= self.inline_threshold {
                    None
                } else {
                    Some(self.filename_callback.filename_for_key(key))
                }
            }
        }
    }

    /// Returns the value for `key`: memory if present, else disk (promoting
    /// the decoded value into memory before returning).
    pub async fn get(&self, key: &str) -> Result<Option<Arc<T>>> {
        Ok(self.get_with_extended_data(key).await?.map(|(v, _)| v))
    }

    pub async fn get_with_extended_data(
        &self,
        key: &str,
    ) -> Result<Option<(Arc<T>, Option<Arc<Vec<u8>>>)>> {
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(entry) = self.memory.get(key) {
            return Ok(Some((entry.value.clone(), entry.extended_data.clone())));
        }

        let disk = self.disk.clone();
        let owned_key = key.to_string();
        let handle = tokio::task::spawn_blocking(move || disk.get_item(&owned_key));
        let Some(item) = join(handle).await? else {
            return Ok(None);
        };

        let value = Arc::new((self.unarchive)(&item.value)?);
        let extended_data = item.extended_data.map(Arc::new);
        let cost = item.size;
        self.memory.set(
            key,
            Entry {
                value: value.clone(),
                extended_data: extended_data.clone(),
            },
            cost,
        );
        Ok(Some((value, extended_data)))
    }

    pub async fn set(&self, key: impl Into<String>, value: T) -> Result<()> {
        self.set_with_extended_data(key, value, None).await
    }

    /// Encodes `value`, then writes memory and disk concurrently (disk on a
    /// background worker).
    pub async fn set_with_extended_data(
        &self,
        key: impl Into<String>,
        value: T,
        extended_data: Option<Vec<u8>>,
    ) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidInput {
                reason: "set requires a non-empty key".into(),
            });
        }
        let encoded = (self.archive)(&value)?;
        let cost = encoded.len() as u64;
        let filename = self.route_filename(&key, cost);

        let item = StorageItem {
            key: key.clone(),
            value: encoded,
            filename,
            size: cost,
            mod_time: 0,
            access_time: 0,
            extended_data: extended_data.clone(),
        };

        // spawn_blocking starts running on the blocking pool immediately, so
        // the disk write and the memory insert below proceed concurrently.
        let disk = self.disk.clone();
        let save = tokio::task::spawn_blocking(move || disk.save(item));

        self.memory.set(
            key,
            Entry {
                value: Arc::new(value),
                extended_data: extended_data.map(Arc::new),
            },
            cost,
        );

        join(save).await?;
        Ok(())
    }

    /// Fire-and-forget write: returns immediately, invokes `callback` on
    /// completion.
    pub fn set_async(
        self: &Arc<Self>,
        key: impl Into<String>,
        value: T,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        let key = key.into();
        tokio::task::spawn(async move { callback(this.set(key, value).await) });
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.memory.remove(key);
        let disk = self.disk.clone();
        let owned = key.to_string();
        join(tokio::task::spawn_blocking(move || disk.remove(&owned))).await
    }

    pub fn remove_async(
        self: &Arc<Self>,
        key: impl Into<String>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        let key = key.into();
        tokio::task::spawn(async move { callback(this.remove(&key).await) });
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.memory.remove_all();
        let disk = self.disk.clone();
        join(tokio::task::spawn_blocking(move || disk.remove_all())).await
    }

    pub async fn trim_to_count(&self, count: u64) -> Result<()> {
        self.memory.trim_to_count(count);
        let disk = self.disk.clone();
        join(tokio::task::spawn_blocking(move || disk.trim_to_count(count))).await
    }

    pub async fn trim_to_cost(&self, cost: u64) -> Result<()> {
        self.memory.trim_to_cost(cost);
        let disk = self.disk.clone();
        join(tokio::task::spawn_blocking(move || disk.trim_to_size(cost))).await
    }

    pub async fn trim_to_age(&self, age: Duration) -> Result<()> {
        self.memory.trim_to_age(age);
        let cutoff = now_unix() - age.as_secs() as i64;
        let disk = self.disk.clone();
        join(tokio::task::spawn_blocking(move || disk.remove_earlier_than(cutoff))).await
    }

    /// Authoritative entry count; queries disk.
    pub async fn count(&self) -> i64 {
        let disk = self.disk.clone();
        tokio::task::spawn_blocking(move || disk.count()).await.unwrap_or(-1)
    }

    /// Authoritative total byte cost; queries disk.
    pub async fn cost(&self) -> i64 {
        let disk = self.disk.clone();
        tokio::task::spawn_blocking(move || disk.size()).await.unwrap_or(-1)
    }

    /// Stops the façade's free-disk-space timer and cascades shutdown to
    /// both engines, then forgets this path's interned instance. No
    /// callback fires after this returns.
    pub async fn close(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.trim_handle.lock().take() {
            let _ = handle.await;
        }
        self.memory.shutdown().await;
        self.disk.shutdown().await;
        intern_forget(&self.path);
    }
}

fn panicked() -> Error {
    Error::Io {
        source: std::io::Error::other("background worker task panicked"),
    }
}

/// Awaits a `spawn_blocking` handle, collapsing a task panic into an `Io`
/// error so callers see one error type regardless of cause.
async fn join<R: Send + 'static>(handle: JoinHandle<Result<R>>) -> Result<R> {
    handle.await.map_err(|_| panicked())?
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Polls free disk space each tick and, if under the floor, halves the
/// disk entry count: a repeated halving across ticks rather than a single
/// aggressive trim.
fn spawn_free_space_timer<T: Send + Sync + 'static>(cache: Arc<Cache<T>>) -> JoinHandle<()> {
    let shutdown = cache.shutdown.clone();
    let interval = cache.trim_interval;
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if cache.free_disk_space_limit == 0 {
                        continue;
                    }
                    let cache = cache.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        let free = platform::free_bytes(&cache.path);
                        if free < cache.free_disk_space_limit {
                            let total = cache.disk.count();
                            if total > 0 {
                                let _ = cache.disk.trim_to_count(total as u64 / 2);
                            }
                        }
                    })
                    .await;
                }
                _ = shutdown.notified() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskConfig, MemoryConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir_calls: Arc<AtomicUsize>) -> CacheConfig<String> {
        CacheConfig {
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            free_disk_space_limit: 0,
            archive: Box::new(|v: &String| Ok(bincode::serialize(v).unwrap())),
            unarchive: Box::new(move |bytes: &[u8]| {
                dir_calls.fetch_add(1, Ordering::SeqCst);
                bincode::deserialize(bytes).map_err(|e| Error::Encoding { reason: e.to_string() })
            }),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::open(dir.path(), config(calls)).unwrap();
        cache.set("k", "hello".to_string()).await.unwrap();
        assert_eq!(*cache.get("k").await.unwrap().unwrap(), "hello");
        cache.close().await;
    }

    #[tokio::test]
    async fn disk_hit_promotes_into_memory_and_avoids_second_decode() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::open(dir.path(), config(calls.clone())).unwrap();
        cache.set("k", "hello".to_string()).await.unwrap();
        // Evict from memory directly so the next get is a disk-tier hit.
        cache.memory.remove("k");

        assert_eq!(*cache.get("k").await.unwrap().unwrap(), "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second read should come from memory: no additional decode call.
        assert_eq!(*cache.get("k").await.unwrap().unwrap(), "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn remove_fans_out_to_both_tiers() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::open(dir.path(), config(calls)).unwrap();
        cache.set("k", "hello".to_string()).await.unwrap();
        cache.remove("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.count().await, 0);
        cache.close().await;
    }

    #[tokio::test]
    async fn reopening_same_path_returns_interned_instance() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = Cache::open(dir.path(), config(calls.clone())).unwrap();
        let b = Cache::open(dir.path(), config(calls)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.close().await;
    }

    #[tokio::test]
    async fn extended_data_rides_with_the_item() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::open(dir.path(), config(calls)).unwrap();
        cache
            .set_with_extended_data("k", "hello".to_string(), Some(b"side".to_vec()))
            .await
            .unwrap();
        let (value, extended) = cache.get_with_extended_data("k").await.unwrap().unwrap();
        assert_eq!(*value, "hello");
        assert_eq!(*extended.unwrap(), b"side".to_vec());
        cache.close().await;
    }
}
