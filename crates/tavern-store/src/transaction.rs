//! Snapshot, mutate, commit or roll back one user document.

use std::sync::Arc;

use serde_json::Value;

use tavern_core::{document, Document, LedgerEntry, UserId};

use crate::error::{Result, StoreError};
use crate::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Begun,
    Committed,
    RolledBack,
}

/// A unit of work over a single user's document.
///
/// `begin` snapshots the current document; mutations touch only the working
/// copy and queued ledger entries, never durable storage. `commit` persists
/// the working copy and then appends the queued entries, in that order.
/// `Committed` and `RolledBack` are terminal; mutating a closed transaction
/// returns `TransactionClosed`.
///
/// A failed `commit` leaves the transaction open and remembers how many
/// ledger entries already landed, so calling `commit` again resumes instead
/// of double-applying. Dropping an uncommitted transaction writes nothing;
/// drop is the automatic rollback.
pub struct Transaction {
    provider: Arc<dyn Provider>,
    user_id: UserId,
    original: Document,
    pending: Document,
    queued: Vec<(String, LedgerEntry)>,
    appended: usize,
    state: TxState,
}

fn genesis(user_id: &UserId) -> Document {
    let mut doc = Document::new();
    doc.insert(
        "user_id".to_string(),
        Value::String(user_id.as_str().to_string()),
    );
    doc.insert(
        "inventory".to_string(),
        Value::Object(serde_json::Map::new()),
    );
    doc.insert("version".to_string(), Value::from(1));
    doc
}

impl Transaction {
    /// Open a transaction on `user_id`, snapshotting their document.
    ///
    /// An absent user starts from a genesis document with empty balances
    /// and an empty inventory; nothing is persisted until `commit`.
    ///
    /// # Errors
    /// Provider failures loading the document.
    pub async fn begin(provider: Arc<dyn Provider>, user_id: UserId) -> Result<Self> {
        let original = match provider.get_user(&user_id).await? {
            Some(doc) => doc,
            None => genesis(&user_id),
        };
        Ok(Self::from_snapshot(provider, user_id, original))
    }

    /// Open a transaction on a snapshot the caller already holds, skipping
    /// the provider read. Commit still goes through `provider`.
    #[must_use]
    pub fn from_snapshot(provider: Arc<dyn Provider>, user_id: UserId, original: Document) -> Self {
        let pending = original.clone();
        Self {
            provider,
            user_id,
            original,
            pending,
            queued: Vec::new(),
            appended: 0,
            state: TxState::Begun,
        }
    }

    /// The user this transaction operates on.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The working copy, including uncommitted mutations.
    #[must_use]
    pub fn working(&self) -> &Document {
        &self.pending
    }

    /// The snapshot taken at `begin`.
    #[must_use]
    pub fn original(&self) -> &Document {
        &self.original
    }

    /// Read a dotted-path key from the working copy.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        document::get(&self.pending, key)
    }

    /// Set a dotted-path key in the working copy.
    ///
    /// # Errors
    /// `TransactionClosed` after commit or rollback.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.ensure_open("set")?;
        document::set(&mut self.pending, key, value);
        Ok(())
    }

    /// Add `delta` to a numeric dotted-path key, treating missing or
    /// non-numeric values as 0. Returns the new value.
    ///
    /// # Errors
    /// `TransactionClosed` after commit or rollback.
    pub fn incr(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.ensure_open("incr")?;
        Ok(document::incr_i64(&mut self.pending, key, delta))
    }

    /// Subtract `delta` from a numeric dotted-path key. Returns the new
    /// value.
    ///
    /// # Errors
    /// `TransactionClosed` after commit or rollback.
    pub fn decr(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.ensure_open("decr")?;
        Ok(document::incr_i64(&mut self.pending, key, -delta))
    }

    /// Queue a ledger entry to be appended on commit.
    ///
    /// Queued facts are never partially visible: either the commit appends
    /// them or they vanish with the transaction.
    ///
    /// # Errors
    /// `TransactionClosed` after commit or rollback.
    pub fn add_ledger_entry(&mut self, ledger: impl Into<String>, entry: LedgerEntry) -> Result<()> {
        self.ensure_open("add_ledger_entry")?;
        self.queued.push((ledger.into(), entry));
        Ok(())
    }

    /// Persist the working copy, then append queued ledger entries in
    /// order.
    ///
    /// # Errors
    /// Provider failures. The transaction stays open; a retried commit
    /// re-saves the document (same content) and resumes the ledger appends
    /// where they stopped.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        self.provider.save_user(&self.user_id, &self.pending).await?;
        while self.appended < self.queued.len() {
            let (ledger, entry) = &self.queued[self.appended];
            self.provider.append_ledger(ledger, entry).await?;
            self.appended += 1;
        }
        self.state = TxState::Committed;
        tracing::debug!(user_id = %self.user_id, entries = self.queued.len(), "transaction committed");
        Ok(())
    }

    /// Discard all mutations and queued entries; never writes.
    ///
    /// # Errors
    /// `TransactionClosed` after commit or rollback.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        self.pending = self.original.clone();
        self.queued.clear();
        self.appended = 0;
        self.state = TxState::RolledBack;
        tracing::debug!(user_id = %self.user_id, "transaction rolled back");
        Ok(())
    }

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.state == TxState::Begun {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed(op))
        }
    }
}
