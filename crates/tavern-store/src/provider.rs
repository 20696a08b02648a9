//! The storage backend contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tavern_core::{Document, LedgerEntry, UserId};

use crate::error::Result;

/// Outcome of an operator-driven bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// `"success"`, `"partial"`, `"already-local"` or `"unsupported"`.
    pub status: String,
    /// Whether the run was a dry run (counted, nothing written).
    pub dry_run: bool,
    /// User documents migrated (or counted, when dry).
    pub users_migrated: usize,
    /// Section documents migrated (or counted, when dry).
    pub sections_migrated: usize,
    /// Per-record failures; never fatal to the run.
    pub errors: Vec<String>,
}

impl MigrationReport {
    /// An empty report with the given status.
    #[must_use]
    pub fn new(status: impl Into<String>, dry_run: bool) -> Self {
        Self {
            status: status.into(),
            dry_run,
            users_migrated: 0,
            sections_migrated: 0,
            errors: Vec::new(),
        }
    }

    /// Downgrade the status to `"partial"` if any record failed.
    pub fn finish(&mut self) {
        if !self.errors.is_empty() {
            self.status = "partial".to_string();
        }
    }
}

/// A storage backend for user documents, named sections and ledgers.
///
/// Backends are chosen by explicit construction and injected; business
/// logic never dispatches on a provider name. Implementations must be safe
/// for concurrent callers on *different* keys; serializing writes to the
/// same key is the caller's job (one active transaction per user).
///
/// A missing record is `Ok(None)`, never an error. Malformed persisted
/// content is a `Serialization` error with the stored bytes left in place.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Fetch one user's document.
    ///
    /// # Errors
    /// Backend failures; `Ok(None)` when the user has no document.
    async fn get_user(&self, user_id: &UserId) -> Result<Option<Document>>;

    /// Persist one user's document.
    ///
    /// # Errors
    /// Backend failures. Durability timing is backend-specific; local
    /// storage may debounce.
    async fn save_user(&self, user_id: &UserId, doc: &Document) -> Result<()>;

    /// Fetch a named global section.
    ///
    /// # Errors
    /// Backend failures, or `InvalidKey` for a malformed section name.
    async fn get_section(&self, section: &str) -> Result<Option<Document>>;

    /// Persist a named global section.
    ///
    /// # Errors
    /// Backend failures, or `InvalidKey` for a malformed section name.
    async fn save_section(&self, section: &str, doc: &Document) -> Result<()>;

    /// Append an entry to a named ledger.
    ///
    /// Appends are idempotent on `entry.entry_id`: a duplicate id is
    /// silently skipped, which is what makes a retried commit safe.
    ///
    /// # Errors
    /// Backend failures, or `InvalidKey` for a malformed ledger name.
    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> Result<()>;

    /// Read a ledger's entries in append order.
    ///
    /// # Errors
    /// Backend failures; a missing ledger reads as empty.
    async fn read_ledger(&self, name: &str) -> Result<Vec<LedgerEntry>>;

    /// Copy every local record into this backend.
    ///
    /// # Errors
    /// Backend failures reaching either side; per-record failures are
    /// reported, not raised.
    async fn sync_local_to_remote(&self) -> Result<MigrationReport>;

    /// Write this backend's records out to local storage.
    ///
    /// # Errors
    /// Backend failures reaching either side; per-record failures are
    /// reported, not raised.
    async fn sync_remote_to_local(&self) -> Result<MigrationReport>;

    /// Migrate local records into this backend, optionally as a dry run.
    ///
    /// # Errors
    /// Backend failures reaching either side; per-record failures are
    /// reported, not raised.
    async fn migrate_local_to_remote(&self, dry_run: bool) -> Result<MigrationReport>;
}
