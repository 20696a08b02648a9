//! In-memory storage provider.
//!
//! [`MemoryStore`] stands in for a real remote backend: in tests it is the
//! injected "provider" whose outages are simulated with [`set_offline`],
//! and with a local mirror attached its bulk operations move data between
//! memory and disk the way a real remote migration would.
//!
//! [`set_offline`]: MemoryStore::set_offline

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use tavern_core::{Document, LedgerEntry, UserId};

use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::paths;
use crate::provider::{MigrationReport, Provider};

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hash-map backed [`Provider`] with switchable availability.
///
/// Ledger appends follow the same idempotency contract as the local store:
/// a duplicate `entry_id` is skipped silently.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, Document>>,
    sections: RwLock<HashMap<String, Document>>,
    ledgers: Mutex<HashMap<String, Vec<LedgerEntry>>>,
    offline: AtomicBool,
    mirror: Option<Arc<LocalStore>>,
}

impl MemoryStore {
    /// An empty, online store without a local mirror.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store whose bulk operations move data to and from `mirror`.
    #[must_use]
    pub fn with_mirror(mirror: Arc<LocalStore>) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::default()
        }
    }

    /// Simulate losing or regaining connectivity.
    ///
    /// While offline, every trait call returns `ProviderUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        tracing::info!(offline, "memory provider availability changed");
    }

    /// Whether the store is currently simulating an outage.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_offline() {
            return Err(StoreError::ProviderUnavailable(
                "memory provider offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<Document>> {
        self.ensure_online()?;
        Ok(read_lock(&self.users).get(user_id).cloned())
    }

    async fn save_user(&self, user_id: &UserId, doc: &Document) -> Result<()> {
        self.ensure_online()?;
        write_lock(&self.users).insert(user_id.clone(), doc.clone());
        Ok(())
    }

    async fn get_section(&self, section: &str) -> Result<Option<Document>> {
        self.ensure_online()?;
        paths::checked_name(section)?;
        Ok(read_lock(&self.sections).get(section).cloned())
    }

    async fn save_section(&self, section: &str, doc: &Document) -> Result<()> {
        self.ensure_online()?;
        paths::checked_name(section)?;
        write_lock(&self.sections).insert(section.to_string(), doc.clone());
        Ok(())
    }

    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> Result<()> {
        self.ensure_online()?;
        paths::checked_name(name)?;
        let mut ledgers = mutex_lock(&self.ledgers);
        let entries = ledgers.entry(name.to_string()).or_default();
        if entries.iter().any(|e| e.entry_id == entry.entry_id) {
            tracing::debug!(ledger = name, entry_id = %entry.entry_id, "skipping duplicate ledger entry");
            return Ok(());
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn read_ledger(&self, name: &str) -> Result<Vec<LedgerEntry>> {
        self.ensure_online()?;
        paths::checked_name(name)?;
        Ok(mutex_lock(&self.ledgers)
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn sync_local_to_remote(&self) -> Result<MigrationReport> {
        self.ensure_online()?;
        let Some(mirror) = &self.mirror else {
            tracing::warn!("sync_local_to_remote requested without a local mirror");
            return Ok(MigrationReport::new("unsupported", false));
        };

        let mut report = MigrationReport::new("success", false);
        for user_id in mirror.list_users().await? {
            match mirror.get_user(&user_id).await {
                Ok(Some(doc)) => {
                    write_lock(&self.users).insert(user_id, doc);
                    report.users_migrated += 1;
                }
                Ok(None) => {}
                Err(error) => report.errors.push(format!("user {user_id}: {error}")),
            }
        }
        for section in mirror.list_sections().await? {
            match mirror.get_section(&section).await {
                Ok(Some(doc)) => {
                    write_lock(&self.sections).insert(section, doc);
                    report.sections_migrated += 1;
                }
                Ok(None) => {}
                Err(error) => report.errors.push(format!("section {section}: {error}")),
            }
        }
        report.finish();
        tracing::info!(
            users = report.users_migrated,
            sections = report.sections_migrated,
            errors = report.errors.len(),
            "pulled local state into memory provider"
        );
        Ok(report)
    }

    async fn sync_remote_to_local(&self) -> Result<MigrationReport> {
        self.ensure_online()?;
        let Some(mirror) = &self.mirror else {
            tracing::warn!("sync_remote_to_local requested without a local mirror");
            return Ok(MigrationReport::new("unsupported", false));
        };

        let mut report = MigrationReport::new("success", false);
        let users: Vec<(UserId, Document)> = read_lock(&self.users)
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();
        for (user_id, doc) in users {
            match mirror.save_user_now(&user_id, &doc).await {
                Ok(()) => report.users_migrated += 1,
                Err(error) => report.errors.push(format!("user {user_id}: {error}")),
            }
        }
        let sections: Vec<(String, Document)> = read_lock(&self.sections)
            .iter()
            .map(|(name, doc)| (name.clone(), doc.clone()))
            .collect();
        for (section, doc) in sections {
            match mirror.save_section_now(&section, &doc).await {
                Ok(()) => report.sections_migrated += 1,
                Err(error) => report.errors.push(format!("section {section}: {error}")),
            }
        }
        report.finish();
        tracing::info!(
            users = report.users_migrated,
            sections = report.sections_migrated,
            errors = report.errors.len(),
            "wrote memory provider state out to local storage"
        );
        Ok(report)
    }

    async fn migrate_local_to_remote(&self, dry_run: bool) -> Result<MigrationReport> {
        self.ensure_online()?;
        let Some(mirror) = &self.mirror else {
            tracing::warn!("migrate_local_to_remote requested without a local mirror");
            return Ok(MigrationReport::new("unsupported", dry_run));
        };

        let mut report = MigrationReport::new("success", dry_run);
        for user_id in mirror.list_users().await? {
            match mirror.get_user(&user_id).await {
                Ok(Some(doc)) => {
                    if !dry_run {
                        write_lock(&self.users).insert(user_id, doc);
                    }
                    report.users_migrated += 1;
                }
                Ok(None) => {}
                Err(error) => report.errors.push(format!("user {user_id}: {error}")),
            }
        }
        for section in mirror.list_sections().await? {
            match mirror.get_section(&section).await {
                Ok(Some(doc)) => {
                    if !dry_run {
                        write_lock(&self.sections).insert(section, doc);
                    }
                    report.sections_migrated += 1;
                }
                Ok(None) => {}
                Err(error) => report.errors.push(format!("section {section}: {error}")),
            }
        }
        report.finish();
        tracing::info!(
            dry_run,
            users = report.users_migrated,
            sections = report.sections_migrated,
            "migration pass finished"
        );
        Ok(report)
    }
}
