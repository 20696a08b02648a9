//! The offline purchase queue file.
//!
//! One JSON array of pending transactions, rewritten whole on every change.
//! Entries that no longer parse stay in the file verbatim so a bad record
//! is never silently dropped; the reconciliation pass reports them instead.
//!
//! [`OfflineQueue`] itself does no locking. The service serializes access
//! through its own queue mutex, which also keeps an entire reconciliation
//! pass atomic with respect to new offline purchases.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;

use tavern_core::PendingOfflineTransaction;
use tavern_store::{Result, StoreError};

/// One raw slot of the queue file.
#[derive(Debug)]
pub enum QueueSlot {
    /// A well-formed pending transaction.
    Parsed(Box<PendingOfflineTransaction>),
    /// Bytes that stopped parsing; preserved for manual inspection.
    Malformed(Value),
}

/// File-backed queue of purchases awaiting reconciliation.
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
}

impl OfflineQueue {
    /// A queue stored at `path`. The file appears on first append.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Where the queue lives on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, read-modify-write.
    ///
    /// # Errors
    /// `Io` reading or writing the file; `Serialization` when the existing
    /// file is not a JSON array.
    pub async fn append(&self, entry: &PendingOfflineTransaction) -> Result<()> {
        let mut raw = self.load_raw().await?;
        let value = serde_json::to_value(entry).map_err(|source| StoreError::Serialization {
            path: self.path.clone(),
            source,
        })?;
        raw.push(value);
        self.write_raw(&raw).await
    }

    /// Current entries, each parsed individually.
    ///
    /// # Errors
    /// `Io` reading the file; `Serialization` when the file as a whole is
    /// not a JSON array. A single entry failing to parse is not an error;
    /// it comes back as [`QueueSlot::Malformed`].
    pub async fn load(&self) -> Result<Vec<QueueSlot>> {
        let raw = self.load_raw().await?;
        let mut slots = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<PendingOfflineTransaction>(value.clone()) {
                Ok(entry) => slots.push(QueueSlot::Parsed(Box::new(entry))),
                Err(error) => {
                    tracing::warn!(%error, "queue entry failed to parse, preserving it verbatim");
                    slots.push(QueueSlot::Malformed(value));
                }
            }
        }
        Ok(slots)
    }

    /// Number of entries currently queued, parseable or not.
    ///
    /// # Errors
    /// Same as [`load`](Self::load).
    pub async fn count(&self) -> Result<usize> {
        Ok(self.load_raw().await?.len())
    }

    /// Replace the queue with `remaining`, deleting the file when empty.
    ///
    /// # Errors
    /// `Io` writing or deleting the file.
    pub async fn rewrite(&self, remaining: &[Value]) -> Result<()> {
        if remaining.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
            return Ok(());
        }
        self.write_raw(remaining).await
    }

    async fn load_raw(&self) -> Result<Vec<Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_raw(&self, entries: &[Value]) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(entries).map_err(|source| StoreError::Serialization {
                path: self.path.clone(),
                source,
            })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tavern_core::{quote, Item, PurchaseTransaction, UserId};
    use tempfile::TempDir;

    fn pending_entry(queue_path: &Path) -> PendingOfflineTransaction {
        let mut item = Item::new("ale", "Mug of Ale");
        item.base_price.insert("gold".to_string(), 10);
        let snapshot = quote(&item, 1, None, "gold", 1.0);
        let tx = PurchaseTransaction::new(
            UserId::new("alice").unwrap(),
            "ale",
            1,
            snapshot,
            BTreeMap::from([("gold".to_string(), 100)]),
            BTreeMap::from([("gold".to_string(), 90)]),
        );
        PendingOfflineTransaction::new(tx, queue_path.to_path_buf())
    }

    #[tokio::test]
    async fn append_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::new(dir.path().join("pending_transactions.json"));

        assert_eq!(queue.count().await.unwrap(), 0);
        let entry = pending_entry(queue.path());
        queue.append(&entry).await.unwrap();
        queue.append(&pending_entry(queue.path())).await.unwrap();

        let slots = queue.load().await.unwrap();
        assert_eq!(slots.len(), 2);
        match &slots[0] {
            QueueSlot::Parsed(parsed) => {
                assert_eq!(parsed.transaction.tx_id, entry.transaction.tx_id);
            }
            QueueSlot::Malformed(_) => panic!("expected parsed entry"),
        }
    }

    #[tokio::test]
    async fn malformed_entries_are_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending_transactions.json");
        std::fs::write(&path, br#"[{"garbage": true}]"#).unwrap();

        let queue = OfflineQueue::new(path);
        let slots = queue.load().await.unwrap();
        assert_eq!(slots.len(), 1);
        assert!(matches!(&slots[0], QueueSlot::Malformed(v) if v["garbage"] == json!(true)));
    }

    #[tokio::test]
    async fn rewrite_empty_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::new(dir.path().join("pending_transactions.json"));
        queue.append(&pending_entry(queue.path())).await.unwrap();
        assert!(queue.path().exists());

        queue.rewrite(&[]).await.unwrap();
        assert!(!queue.path().exists());
        // deleting an already-missing file is fine
        queue.rewrite(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending_transactions.json");
        std::fs::write(&path, b"not an array").unwrap();

        let queue = OfflineQueue::new(path.clone());
        assert!(matches!(
            queue.load().await,
            Err(StoreError::Serialization { .. })
        ));
        // file left untouched for inspection
        assert_eq!(std::fs::read(&path).unwrap(), b"not an array");
    }
}
