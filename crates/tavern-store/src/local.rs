//! File-backed local storage.
//!
//! [`LocalStore`] persists documents as pretty-printed JSON files under a
//! single data directory, with three write-path behaviors layered on top:
//!
//! - a TTL cache giving read-your-writes without waiting for disk;
//! - a debounced writer that collapses bursts of saves to one flush;
//! - a backup copy of every file about to be overwritten.
//!
//! Flushes write to a unique temporary file and rename it into place, so a
//! superseded flush is never observable as a torn file. Ledgers bypass all
//! of this: they are append-only NDJSON logs with idempotent appends.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use tavern_core::{Document, LedgerEntry, UserId};

use crate::error::{Result, StoreError};
use crate::paths;
use crate::provider::{MigrationReport, Provider};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_CACHE_TTL_MS: u64 = 5_000;

/// Settings for a [`LocalStore`].
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Root directory for all persisted state.
    pub data_dir: PathBuf,

    /// How long a save may sit before being flushed to disk.
    pub debounce_interval: Duration,

    /// How long a cached document stays fresh.
    pub cache_ttl: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            debounce_interval: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
        }
    }
}

impl LocalStoreConfig {
    /// Build a config from `TAVERN_DATA_DIR`, `TAVERN_DEBOUNCE_MS` and
    /// `TAVERN_CACHE_TTL_MS`, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("TAVERN_DATA_DIR")
                .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string())
                .into(),
            debounce_interval: Duration::from_millis(
                std::env::var("TAVERN_DEBOUNCE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_DEBOUNCE_MS),
            ),
            cache_ttl: Duration::from_millis(
                std::env::var("TAVERN_CACHE_TTL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CACHE_TTL_MS),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    User(UserId),
    Section(String),
}

#[derive(Debug)]
struct Inner {
    config: LocalStoreConfig,
    cache: Mutex<HashMap<CacheKey, (Document, Instant)>>,
    pending: Mutex<HashMap<CacheKey, JoinHandle<()>>>,
    ledger_ids: tokio::sync::Mutex<HashMap<String, HashSet<String>>>,
    tmp_seq: AtomicU64,
}

/// File-backed [`Provider`] with caching, debounced writes and backups.
///
/// Cloning is cheap and clones share all state. Debounced saves become
/// durable `debounce_interval` after the last save for their key; the
/// `*_now` variants flush before returning.
#[derive(Debug, Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Open a store, creating the directory layout if needed.
    ///
    /// # Errors
    /// `InvalidConfig` when `cache_ttl < debounce_interval` (a cached write
    /// must stay fresh at least until its pending flush lands, or
    /// read-your-writes breaks); `Io` when a directory cannot be created.
    pub fn new(config: LocalStoreConfig) -> Result<Self> {
        if config.cache_ttl < config.debounce_interval {
            return Err(StoreError::InvalidConfig(format!(
                "cache_ttl {:?} must be at least debounce_interval {:?}",
                config.cache_ttl, config.debounce_interval
            )));
        }
        let dirs = [
            config.data_dir.clone(),
            paths::users_dir(&config.data_dir),
            paths::backups_dir(&config.data_dir),
            paths::ledgers_dir(&config.data_dir),
        ];
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        tracing::info!(data_dir = %config.data_dir.display(), "opened local store");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                ledger_ids: tokio::sync::Mutex::new(HashMap::new()),
                tmp_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Save a user's document, flushed to disk before returning.
    ///
    /// # Errors
    /// `Io` or `Serialization` from the flush.
    pub async fn save_user_now(&self, user_id: &UserId, doc: &Document) -> Result<()> {
        self.inner
            .save_now(CacheKey::User(user_id.clone()), doc)
            .await
    }

    /// Save a section document, flushed to disk before returning.
    ///
    /// # Errors
    /// `InvalidKey` for a bad section name; `Io` or `Serialization` from
    /// the flush.
    pub async fn save_section_now(&self, section: &str, doc: &Document) -> Result<()> {
        paths::section_file(&self.inner.config.data_dir, section)?;
        self.inner
            .save_now(CacheKey::Section(section.to_string()), doc)
            .await
    }

    /// Ids of every user with a stored document, sorted.
    ///
    /// # Errors
    /// `Io` when the users directory cannot be read.
    pub async fn list_users(&self) -> Result<Vec<UserId>> {
        let dir = paths::users_dir(&self.inner.config.data_dir);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut users = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    match UserId::new(stem) {
                        Ok(user) => users.push(user),
                        Err(_) => {
                            tracing::warn!(file = name, "skipping user file with invalid id");
                        }
                    }
                }
            }
        }
        users.sort();
        Ok(users)
    }

    /// Number of users with a stored document.
    ///
    /// # Errors
    /// `Io` when the users directory cannot be read.
    pub async fn user_count(&self) -> Result<usize> {
        Ok(self.list_users().await?.len())
    }

    /// Names of every stored section, sorted.
    ///
    /// # Errors
    /// `Io` when the data directory cannot be read.
    pub async fn list_sections(&self) -> Result<Vec<String>> {
        let dir = self.inner.config.data_dir.clone();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut sections = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let file_type = entry.file_type().await.map_err(|source| StoreError::Io {
                path: entry.path(),
                source,
            })?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    sections.push(stem.to_string());
                }
            }
        }
        sections.sort();
        Ok(sections)
    }

    /// Delete backups older than `older_than`, returning how many were
    /// removed.
    ///
    /// Backup growth is unbounded by design; this is the explicit retention
    /// knob for operators.
    ///
    /// # Errors
    /// `Io` when the backups directory cannot be read. Failures deleting an
    /// individual backup are logged and skipped.
    pub async fn prune_backups(&self, older_than: Duration) -> Result<usize> {
        let dir = paths::backups_dir(&self.inner.config.data_dir);
        let age_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age_ms);

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let file_name = entry.file_name();
            let Some(millis) = file_name.to_str().and_then(paths::backup_millis) else {
                continue;
            };
            if millis >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(error) => {
                    tracing::warn!(path = %entry.path().display(), %error, "failed to prune backup");
                }
            }
        }
        tracing::debug!(removed, "pruned old backups");
        Ok(removed)
    }
}

impl Inner {
    fn cache_lock(&self) -> MutexGuard<'_, HashMap<CacheKey, (Document, Instant)>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashMap<CacheKey, JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Document> {
        let mut cache = self.cache_lock();
        match cache.get(key) {
            Some((doc, expires_at)) if Instant::now() <= *expires_at => Some(doc.clone()),
            Some(_) => {
                // expired: evict on touch
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: CacheKey, doc: Document) {
        let expires_at = Instant::now() + self.config.cache_ttl;
        self.cache_lock().insert(key, (doc, expires_at));
    }

    fn cancel_pending(&self, key: &CacheKey) {
        if let Some(handle) = self.pending_lock().remove(key) {
            handle.abort();
        }
    }

    /// Debounced save: cache now, flush `debounce_interval` later unless a
    /// newer save supersedes this one first.
    fn schedule_flush(self: &Arc<Self>, key: CacheKey, doc: Document) {
        self.cache_put(key.clone(), doc.clone());
        self.cancel_pending(&key);

        let inner = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce_interval).await;
            if let Err(error) = inner.flush(&task_key, &doc).await {
                tracing::error!(%error, "debounced flush failed");
            }
        });
        // Finished handles stay in the map until the next save for the key
        // replaces them; aborting a finished task is a no-op.
        self.pending_lock().insert(key, handle);
    }

    async fn save_now(&self, key: CacheKey, doc: &Document) -> Result<()> {
        self.cache_put(key.clone(), doc.clone());
        self.cancel_pending(&key);
        self.flush(&key, doc).await
    }

    fn path_for(&self, key: &CacheKey) -> Result<PathBuf> {
        match key {
            CacheKey::User(user_id) => Ok(paths::user_file(&self.config.data_dir, user_id)),
            CacheKey::Section(section) => paths::section_file(&self.config.data_dir, section),
        }
    }

    async fn flush(&self, key: &CacheKey, doc: &Document) -> Result<()> {
        let path = self.path_for(key)?;
        self.write_document(&path, doc).await
    }

    async fn write_document(&self, path: &Path, doc: &Document) -> Result<()> {
        self.backup_existing(path).await?;

        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = tmp_path(path, seq);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    async fn backup_existing(&self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        let file_name = match path.file_name().and_then(OsStr::to_str) {
            Some(name) => name,
            None => return Ok(()),
        };
        let backup = paths::backup_file(
            &self.config.data_dir,
            file_name,
            Utc::now().timestamp_millis(),
        );
        tokio::fs::copy(path, &backup)
            .await
            .map_err(|source| StoreError::Io {
                path: backup.clone(),
                source,
            })?;
        tracing::debug!(backup = %backup.display(), "backed up file before overwrite");
        Ok(())
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Document>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> Result<()> {
        let path = paths::ledger_file(&self.config.data_dir, name)?;
        let mut ids = self.ledger_ids.lock().await;
        if !ids.contains_key(name) {
            let existing = load_ledger_ids(&path).await?;
            ids.insert(name.to_string(), existing);
        }
        let seen = ids.entry(name.to_string()).or_default();
        if seen.contains(&entry.entry_id) {
            tracing::debug!(ledger = name, entry_id = %entry.entry_id, "skipping duplicate ledger entry");
            return Ok(());
        }

        let mut line =
            serde_json::to_string(entry).map_err(|source| StoreError::Serialization {
                path: path.clone(),
                source,
            })?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        seen.insert(entry.entry_id.clone());
        Ok(())
    }

    async fn read_ledger(&self, name: &str) -> Result<Vec<LedgerEntry>> {
        let path = paths::ledger_file(&self.config.data_dir, name)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry =
                serde_json::from_str(line).map_err(|source| StoreError::Serialization {
                    path: path.clone(),
                    source,
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn tmp_path(path: &Path, seq: u64) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("document"), OsStr::to_os_string);
    name.push(format!(".{seq}.tmp"));
    path.with_file_name(name)
}

/// Ids already present in a ledger file; absent file reads as empty.
///
/// Unparseable lines only warn here: the id set exists to prevent duplicate
/// appends, and appending must stay available even if one line is damaged.
async fn load_ledger_ids(path: &Path) -> Result<HashSet<String>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut ids = HashSet::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                ids.insert(entry.entry_id);
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unparseable ledger line");
            }
        }
    }
    Ok(ids)
}

// ============================================================================
// Provider implementation
// ============================================================================

#[async_trait]
impl Provider for LocalStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<Document>> {
        let key = CacheKey::User(user_id.clone());
        if let Some(doc) = self.inner.cache_get(&key) {
            return Ok(Some(doc));
        }
        let path = paths::user_file(&self.inner.config.data_dir, user_id);
        let doc = self.inner.read_document(&path).await?;
        if let Some(doc) = &doc {
            self.inner.cache_put(key, doc.clone());
        }
        Ok(doc)
    }

    async fn save_user(&self, user_id: &UserId, doc: &Document) -> Result<()> {
        self.inner
            .schedule_flush(CacheKey::User(user_id.clone()), doc.clone());
        Ok(())
    }

    async fn get_section(&self, section: &str) -> Result<Option<Document>> {
        let path = paths::section_file(&self.inner.config.data_dir, section)?;
        let key = CacheKey::Section(section.to_string());
        if let Some(doc) = self.inner.cache_get(&key) {
            return Ok(Some(doc));
        }
        let doc = self.inner.read_document(&path).await?;
        if let Some(doc) = &doc {
            self.inner.cache_put(key, doc.clone());
        }
        Ok(doc)
    }

    async fn save_section(&self, section: &str, doc: &Document) -> Result<()> {
        paths::section_file(&self.inner.config.data_dir, section)?;
        self.inner
            .schedule_flush(CacheKey::Section(section.to_string()), doc.clone());
        Ok(())
    }

    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> Result<()> {
        self.inner.append_ledger(name, entry).await
    }

    async fn read_ledger(&self, name: &str) -> Result<Vec<LedgerEntry>> {
        self.inner.read_ledger(name).await
    }

    async fn sync_local_to_remote(&self) -> Result<MigrationReport> {
        tracing::debug!("sync_local_to_remote is a no-op on the local store");
        Ok(MigrationReport::new("already-local", false))
    }

    async fn sync_remote_to_local(&self) -> Result<MigrationReport> {
        tracing::debug!("sync_remote_to_local is a no-op on the local store");
        Ok(MigrationReport::new("already-local", false))
    }

    async fn migrate_local_to_remote(&self, dry_run: bool) -> Result<MigrationReport> {
        tracing::debug!(dry_run, "migrate_local_to_remote is a no-op on the local store");
        Ok(MigrationReport::new("already-local", dry_run))
    }
}
