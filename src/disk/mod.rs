//! Hybrid SQLite + file-directory store: the persistent tier.
//!
//! A single `manifest.sqlite` row exists per entry; the value itself lives
//! either in the row (`inline_data`) or as a file under `data/` (`filename`
//! set, row metadata only). One [`DiskCache`] owns exactly one directory.
//! Concurrency across threads is the façade's job, not this module's: every
//! public method takes `&self` and serializes through `conn`'s mutex, but
//! nothing here stops two unrelated [`DiskCache`] instances from fighting
//! over the same path.

mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::DiskConfig;
use crate::error::{Error, Result};
use crate::item::{StorageItem, StorageItemInfo, StorageType};

/// Access-time refreshes are buffered and flushed once this many have
/// accumulated, or at the next mutating call.
const ACCESS_FLUSH_THRESHOLD: usize = 16;
/// Rows considered per trim iteration.
const TRIM_BATCH: usize = 16;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct DiskCache {
    path: PathBuf,
    data_dir: PathBuf,
    trash_dir: PathBuf,
    conn: Mutex<Connection>,
    config: DiskConfig,
    pending_access: Mutex<Vec<(String, i64)>>,
    shutdown: Arc<Notify>,
    trim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiskCache {
    /// Opens (creating if absent) the hybrid store at `path`.
    ///
    /// Creates `manifest.sqlite`, `data/`, and `trash/` as needed, applies
    /// pragmas, enforces the directory's immutable storage type, and sweeps
    /// any orphan files left behind by a crash between a file write and its
    /// row commit.
    pub fn open(path: impl AsRef<Path>, config: DiskConfig) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let data_dir = path.join("data");
        let trash_dir = path.join("trash");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&trash_dir)?;

        let conn = Connection::open(path.join("manifest.sqlite"))?;
        schema::initialize(&conn)?;
        schema::enforce_storage_type(&conn, config.storage_type)?;

        let cache = Arc::new(Self {
            path,
            data_dir,
            trash_dir,
            conn: Mutex::new(conn),
            config,
            pending_access: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
            trim_handle: Mutex::new(None),
        });
        cache.sweep_orphans()?;
        let handle = spawn_trim_timer(cache.clone());
        *cache.trim_handle.lock() = Some(handle);
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    fn log_error(&self, context: &str, err: &Error) {
        if self.config.error_logs_enabled {
            tracing::error!(context, %err, "disk cache error");
        }
    }

    // ---- write path -------------------------------------------------

    /// Upserts `item`, validating and compensating for a partial write.
    pub fn save(&self, mut item: StorageItem) -> Result<()> {
        if item.key.is_empty() || item.value.is_empty() {
            return Err(Error::InvalidInput {
                reason: "save requires a non-empty key and non-empty value".into(),
            });
        }
        match self.config.storage_type {
            StorageType::File => {
                if item.filename.is_none() {
                    return Err(Error::InvalidInput {
                        reason: "File-type storage requires a filename".into(),
                    });
                }
            }
            StorageType::Sqlite => item.filename = None,
            StorageType::Mixed => {}
        }

        let now = now_unix();
        item.size = item.value.len() as u64;
        item.mod_time = now;
        item.access_time = now;

        if let Some(filename) = item.filename.clone() {
            self.write_external_file(&filename, &item.value)?;
            match self.upsert_row(&item) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Compensating action: the file write succeeded but the
                    // row didn't commit, so remove the orphan we just made.
                    let _ = std::fs::remove_file(self.data_path(&filename));
                    self.log_error("save (upsert after external write)", &e);
                    Err(e)
                }
            }
        } else {
            self.upsert_row(&item)
        }
    }

    fn write_external_file(&self, filename: &str, value: &[u8]) -> Result<()> {
        let path = self.data_path(filename);
        let result = (|| -> Result<()> {
            let mut file = std::fs::File::create(&path)?;
            std::io::Write::write_all(&mut file, value)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(ref e) = result {
            let _ = std::fs::remove_file(&path);
            self.log_error("write_external_file", e);
        }
        result
    }

    /// Upserts the metadata row. Looks up the previous filename first so a
    /// changed or removed external reference is cleaned up after the commit.
    fn upsert_row(&self, item: &StorageItem) -> Result<()> {
        let conn = self.conn.lock();
        let previous_filename = conn
            .query_row(
                "SELECT filename FROM manifest WHERE key = ?1",
                [&item.key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();

        let inline_data: Option<&[u8]> = if item.filename.is_none() {
            Some(&item.value)
        } else {
            None
        };

        conn.execute(
            "INSERT INTO manifest (key, filename, size, inline_data, modification_time, last_access_time, extended_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                size = excluded.size,
                inline_data = excluded.inline_data,
                modification_time = excluded.modification_time,
                last_access_time = excluded.last_access_time,
                extended_data = excluded.extended_data",
            rusqlite::params![
                item.key,
                item.filename,
                item.size as i64,
                inline_data,
                item.mod_time,
                item.access_time,
                item.extended_data,
            ],
        )?;
        drop(conn);

        if let Some(old) = previous_filename {
            if Some(&old) != item.filename.as_ref() {
                let _ = std::fs::remove_file(self.data_path(&old));
            }
        }
        Ok(())
    }

    // ---- read path --------------------------------------------------

    /// Returns the full item, reading the backing file for external rows.
    /// A missing backing file self-heals (row deleted) and is reported as
    /// an `Io` error rather than a plain miss.
    pub fn get_item(&self, key: &str) -> Result<Option<StorageItem>> {
        let row = self.query_row(key)?;
        let Some((mut item, needs_file)) = row else {
            return Ok(None);
        };
        if needs_file {
            let filename = item.filename.clone().expect("external row carries a filename");
            match std::fs::read(self.data_path(&filename)) {
                Ok(bytes) => item.value = bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.remove(key)?;
                    let err = Error::Io { source: e };
                    self.log_error("get_item (self-heal)", &err);
                    return Err(err);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.note_access(key);
        Ok(Some(item))
    }

    /// Metadata only; never touches `data/`.
    pub fn get_item_info(&self, key: &str) -> Result<Option<StorageItemInfo>> {
        let conn = self.conn.lock();
        let info = conn
            .query_row(
                "SELECT key, filename, size, modification_time, last_access_time, extended_data
                 FROM manifest WHERE key = ?1",
                [key],
                |row| {
                    Ok(StorageItemInfo {
                        key: row.get(0)?,
                        filename: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        mod_time: row.get(3)?,
                        access_time: row.get(4)?,
                        extended_data: row.get(5)?,
                    })
                },
            )
            .optional()?;
        drop(conn);
        if info.is_some() {
            self.note_access(key);
        }
        Ok(info)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_item(key)?.map(|item| item.value))
    }

    /// Ordering of the returned vector matches `keys`; absent keys are skipped.
    pub fn get_items(&self, keys: &[String]) -> Result<Vec<StorageItem>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.get_item(key)? {
                out.push(item);
            }
        }
        Ok(out)
    }

    pub fn get_values(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get_value(key)? {
                out.push((key.clone(), value));
            }
        }
        Ok(out)
    }

    /// Returns `(item, needs_file_read)`.
    fn query_row(&self, key: &str) -> Result<Option<(StorageItem, bool)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM manifest WHERE key = ?1",
            [key],
            |row| {
                let filename: Option<String> = row.get(1)?;
                let inline_data: Option<Vec<u8>> = row.get(3)?;
                let needs_file = filename.is_some();
                let item = StorageItem {
                    key: row.get(0)?,
                    value: inline_data.unwrap_or_default(),
                    filename,
                    size: row.get::<_, i64>(2)? as u64,
                    mod_time: row.get(4)?,
                    access_time: row.get(5)?,
                    extended_data: row.get(6)?,
                };
                Ok((item, needs_file))
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Buffers an access-time refresh, flushing once the batch is full.
    fn note_access(&self, key: &str) {
        let mut pending = self.pending_access.lock();
        pending.push((key.to_string(), now_unix()));
        if pending.len() >= ACCESS_FLUSH_THRESHOLD {
            let batch = std::mem::take(&mut *pending);
            drop(pending);
            self.flush_access(batch);
        }
    }

    /// Flushes any buffered access-time refreshes right now. Called before
    /// every mutating operation so a trim never races stale batched reads,
    /// and safe to call at any other time too.
    fn flush_pending_access(&self) {
        let batch = std::mem::take(&mut *self.pending_access.lock());
        self.flush_access(batch);
    }

    fn flush_access(&self, batch: Vec<(String, i64)>) {
        if batch.is_empty() {
            return;
        }
        let conn = self.conn.lock();
        let tx_result = (|| -> rusqlite::Result<()> {
            let mut stmt =
                conn.prepare_cached("UPDATE manifest SET last_access_time = ?2 WHERE key = ?1")?;
            for (key, at) in &batch {
                stmt.execute(rusqlite::params![key, at])?;
            }
            Ok(())
        })();
        if let Err(e) = tx_result {
            self.log_error("flush_access", &e.into());
        }
    }

    // ---- removal ----------------------------------------------------

    pub fn remove(&self, key: &str) -> Result<()> {
        self.flush_pending_access();
        let filename = self.filename_for(key)?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM manifest WHERE key = ?1", [key])?;
        drop(conn);
        if let Some(filename) = filename {
            let _ = std::fs::remove_file(self.data_path(&filename));
        }
        Ok(())
    }

    fn filename_for(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT filename FROM manifest WHERE key = ?1",
            [key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map(Option::flatten)
        .map_err(Error::from)
    }

    pub fn remove_larger_than(&self, size_bytes: u64) -> Result<()> {
        self.flush_pending_access();
        self.delete_where("size > ?1", [size_bytes as i64])
    }

    pub fn remove_earlier_than(&self, unix_ts: i64) -> Result<()> {
        self.flush_pending_access();
        self.delete_where("last_access_time < ?1", [unix_ts])
    }

    fn delete_where(&self, predicate: &str, param: [i64; 1]) -> Result<()> {
        let filenames: Vec<String> = {
            let conn = self.conn.lock();
            let sql = format!("SELECT filename FROM manifest WHERE {predicate} AND filename IS NOT NULL");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param, |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        {
            let conn = self.conn.lock();
            let sql = format!("DELETE FROM manifest WHERE {predicate}");
            conn.execute(&sql, param)?;
        }
        for filename in filenames {
            let _ = std::fs::remove_file(self.data_path(&filename));
        }
        Ok(())
    }

    /// Deletes least-recently-accessed rows in batches of [`TRIM_BATCH`]
    /// until `SELECT SUM(size)` is at or below `target`.
    pub fn trim_to_size(&self, target: u64) -> Result<()> {
        self.flush_pending_access();
        loop {
            if self.size() as i128 <= target as i128 {
                return Ok(());
            }
            if !self.delete_oldest_batch()? {
                return Ok(());
            }
        }
    }

    /// Deletes least-recently-accessed rows in batches of [`TRIM_BATCH`]
    /// until `SELECT COUNT(*)` is at or below `target`.
    pub fn trim_to_count(&self, target: u64) -> Result<()> {
        self.flush_pending_access();
        loop {
            if self.count() as i128 <= target as i128 {
                return Ok(());
            }
            if !self.delete_oldest_batch()? {
                return Ok(());
            }
        }
    }

    /// Deletes up to [`TRIM_BATCH`] rows ordered by `last_access_time ASC`.
    /// Returns `false` when there was nothing left to delete.
    fn delete_oldest_batch(&self) -> Result<bool> {
        let (keys, filenames): (Vec<String>, Vec<Option<String>>) = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT key, filename FROM manifest ORDER BY last_access_time ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([TRIM_BATCH as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            let mut keys = Vec::new();
            let mut filenames = Vec::new();
            for row in rows {
                let (k, f) = row?;
                keys.push(k);
                filenames.push(f);
            }
            (keys, filenames)
        };
        if keys.is_empty() {
            return Ok(false);
        }
        {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
            for key in &keys {
                stmt.execute([key])?;
            }
        }
        for filename in filenames.into_iter().flatten() {
            let _ = std::fs::remove_file(self.data_path(&filename));
        }
        Ok(true)
    }

    /// Trash-and-sweep bulk wipe: renames `data/` and the SQLite files aside
    /// in O(1), recreates an empty store, and deletes the trashed content on
    /// a background task.
    pub fn remove_all(&self) -> Result<()> {
        self.flush_pending_access();
        let trash_entry = self.trash_dir.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&trash_entry)?;

        {
            let mut conn = self.conn.lock();
            // Close out WAL/checkpoint state before moving the files aside.
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
            *conn = Connection::open_in_memory()?; // release the file handle
        }

        rename_if_exists(&self.data_dir, &trash_entry.join("data"))?;
        for suffix in ["", "-wal", "-shm"] {
            let name = format!("manifest.sqlite{suffix}");
            rename_if_exists(&self.path.join(&name), &trash_entry.join(&name))?;
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let fresh = Connection::open(self.path.join("manifest.sqlite"))?;
        schema::initialize(&fresh)?;
        schema::enforce_storage_type(&fresh, self.config.storage_type)?;
        *self.conn.lock() = fresh;

        let trash_dir = self.trash_dir.clone();
        tokio::task::spawn_blocking(move || {
            let _ = std::fs::remove_dir_all(&trash_dir);
            let _ = std::fs::create_dir_all(&trash_dir);
        });
        Ok(())
    }

    /// Row-by-row wipe that reports progress after each deletion.
    pub fn remove_all_with_progress(&self, mut progress: impl FnMut(u64, u64)) -> Result<()> {
        self.flush_pending_access();
        let total = self.count().max(0) as u64;
        let mut removed = 0u64;
        loop {
            let key = {
                let conn = self.conn.lock();
                let row = conn
                    .query_row(
                        "SELECT key FROM manifest ORDER BY last_access_time ASC LIMIT 1",
                        [],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                match row {
                    Some(key) => key,
                    None => break,
                }
            };
            self.remove(&key)?;
            removed += 1;
            progress(removed, total);
        }
        Ok(())
    }

    // ---- aggregates --------------------------------------------------

    /// `SELECT COUNT(*)`; returns `-1` on SQL error.
    pub fn count(&self) -> i64 {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM manifest", [], |row| row.get(0))
            .unwrap_or(-1)
    }

    /// `SELECT SUM(size)`; returns `-1` on SQL error, `0` for an empty store.
    pub fn size(&self) -> i64 {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(SUM(size), 0) FROM manifest", [], |row| row.get(0))
            .unwrap_or(-1)
    }

    // ---- crash recovery -----------------------------------------------

    /// Deletes any file under `data/` with no corresponding manifest row,
    /// the residue of a crash between a file write and its row commit.
    fn sweep_orphans(&self) -> Result<()> {
        let referenced: std::collections::HashSet<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT filename FROM manifest WHERE filename IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    // ---- async variants ---------------------------------------------------

    pub fn save_async(
        self: &Arc<Self>,
        item: StorageItem,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        tokio::task::spawn_blocking(move || callback(this.save(item)));
    }

    pub fn get_item_async(
        self: &Arc<Self>,
        key: impl Into<String>,
        callback: impl FnOnce(Result<Option<StorageItem>>) + Send + 'static,
    ) {
        let this = self.clone();
        let key = key.into();
        tokio::task::spawn_blocking(move || callback(this.get_item(&key)));
    }

    pub fn remove_async(
        self: &Arc<Self>,
        key: impl Into<String>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        let key = key.into();
        tokio::task::spawn_blocking(move || callback(this.remove(&key)));
    }

    pub fn remove_all_async(self: &Arc<Self>, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let this = self.clone();
        tokio::task::spawn_blocking(move || callback(this.remove_all()));
    }

    pub fn trim_to_count_async(
        self: &Arc<Self>,
        target: u64,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        tokio::task::spawn_blocking(move || callback(this.trim_to_count(target)));
    }

    pub fn trim_to_size_async(
        self: &Arc<Self>,
        target: u64,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        tokio::task::spawn_blocking(move || callback(this.trim_to_size(target)));
    }

    // ---- shutdown ---------------------------------------------------------------

    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.trim_handle.lock().take() {
            let _ = handle.await;
        }
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn spawn_trim_timer(cache: Arc<DiskCache>) -> JoinHandle<()> {
    let shutdown = cache.shutdown.clone();
    let interval = cache.config.auto_trim_interval;
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cache = cache.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        let _ = cache.trim_to_count(cache.config.count_limit);
                        let _ = cache.trim_to_size(cache.config.cost_limit);
                        if let Some(age) = cache.config.age_limit {
                            let cutoff = now_unix() - age.as_secs() as i64;
                            let _ = cache.remove_earlier_than(cutoff);
                        }
                    }).await;
                }
                _ = shutdown.notified() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(storage_type: StorageType) -> (TempDir, Arc<DiskCache>) {
        let dir = TempDir::new().unwrap();
        let mut config = DiskConfig::default();
        config.storage_type = storage_type;
        config.auto_trim_interval = Duration::from_secs(3600);
        let cache = DiskCache::open(dir.path(), config).unwrap();
        (dir, cache)
    }

    fn item(key: &str, value: Vec<u8>, filename: Option<&str>) -> StorageItem {
        StorageItem {
            key: key.to_string(),
            value,
            filename: filename.map(str::to_string),
            size: 0,
            mod_time: 0,
            access_time: 0,
            extended_data: None,
        }
    }

    #[tokio::test]
    async fn inline_external_routing() {
        let (_dir, cache) = open(StorageType::Mixed);
        cache.save(item("a", vec![1; 100], None)).unwrap();
        cache.save(item("b", vec![2; 4096], Some("b.bin"))).unwrap();

        assert!(cache.data_path("b.bin").exists());
        assert_eq!(cache.size(), 4196);

        let got = cache.get_item("b").unwrap().unwrap();
        assert_eq!(got.value.len(), 4096);
        assert!(got.filename.is_some());

        let info = cache.get_item_info("a").unwrap().unwrap();
        assert!(info.filename.is_none());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn empty_key_or_value_fails() {
        let (_dir, cache) = open(StorageType::Mixed);
        assert!(cache.save(item("", vec![1], None)).is_err());
        assert!(cache.save(item("k", vec![], None)).is_err());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn file_type_requires_filename() {
        let (_dir, cache) = open(StorageType::File);
        assert!(cache.save(item("k", vec![1], None)).is_err());
        assert!(cache.save(item("k", vec![1], Some("k.bin"))).is_ok());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn sqlite_type_ignores_filename() {
        let (_dir, cache) = open(StorageType::Sqlite);
        cache.save(item("k", vec![1, 2, 3], Some("ignored.bin"))).unwrap();
        assert!(!cache.data_path("ignored.bin").exists());
        let info = cache.get_item_info("k").unwrap().unwrap();
        assert!(info.filename.is_none());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn reopening_with_a_different_storage_type_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut config = DiskConfig::default();
            config.storage_type = StorageType::File;
            DiskCache::open(dir.path(), config).unwrap();
        }
        let mut config = DiskConfig::default();
        config.storage_type = StorageType::Sqlite;
        assert!(DiskCache::open(dir.path(), config).is_err());
    }

    #[tokio::test]
    async fn remove_deletes_row_and_file() {
        let (_dir, cache) = open(StorageType::Mixed);
        cache.save(item("k", vec![1; 10], Some("k.bin"))).unwrap();
        cache.remove("k").unwrap();
        assert!(cache.get_item("k").unwrap().is_none());
        assert!(!cache.data_path("k.bin").exists());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn trim_to_size_evicts_lru() {
        let (_dir, cache) = open(StorageType::Sqlite);
        for i in 0..10 {
            cache.save(item(&format!("k{i}"), vec![0u8; 100], None)).unwrap();
            // Force distinct, monotonically increasing access times.
            let conn = cache.conn.lock();
            conn.execute(
                "UPDATE manifest SET last_access_time = ?1 WHERE key = ?2",
                rusqlite::params![i, format!("k{i}")],
            )
            .unwrap();
        }
        cache.trim_to_size(500).unwrap();
        assert_eq!(cache.count(), 5);
        assert_eq!(cache.size(), 500);
        for i in 0..5 {
            assert!(cache.get_item(&format!("k{i}")).unwrap().is_none());
        }
        for i in 5..10 {
            assert!(cache.get_item(&format!("k{i}")).unwrap().is_some());
        }
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn remove_all_empties_store() {
        let (_dir, cache) = open(StorageType::Mixed);
        for i in 0..20 {
            cache
                .save(item(&format!("k{i}"), vec![0u8; 16], Some(format!("f{i}").as_str())))
                .unwrap();
        }
        cache.remove_all().unwrap();
        assert_eq!(cache.count(), 0);
        assert_eq!(std::fs::read_dir(&cache.data_dir).unwrap().count(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn crash_heal_removes_orphan_file() {
        let dir = TempDir::new().unwrap();
        let mut config = DiskConfig::default();
        config.auto_trim_interval = Duration::from_secs(3600);
        let cache = DiskCache::open(dir.path(), config.clone()).unwrap();
        // Simulate a file write that committed but whose row never did.
        std::fs::write(cache.data_path("orphan.bin"), b"stale").unwrap();
        cache.shutdown().await;
        drop(cache);

        let reopened = DiskCache::open(dir.path(), config).unwrap();
        assert!(!reopened.data_path("orphan.bin").exists());
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn remove_all_with_progress_reports_each_step() {
        let (_dir, cache) = open(StorageType::Sqlite);
        for i in 0..5 {
            cache.save(item(&format!("k{i}"), vec![0u8; 4], None)).unwrap();
        }
        let mut calls = Vec::new();
        cache
            .remove_all_with_progress(|done, total| calls.push((done, total)))
            .unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls.last().unwrap(), &(5, 5));
        assert_eq!(cache.count(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn batch_get_preserves_input_order_and_skips_absent() {
        let (_dir, cache) = open(StorageType::Sqlite);
        cache.save(item("a", vec![1], None)).unwrap();
        cache.save(item("c", vec![3], None)).unwrap();
        let got = cache
            .get_values(&["a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(got, vec![("a".into(), vec![1]), ("c".into(), vec![3])]);
        cache.shutdown().await;
    }
}
