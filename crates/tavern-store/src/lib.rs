//! Storage layer for the tavern economy backend.
//!
//! Everything durable goes through one contract:
//!
//! - **[`Provider`]**: the backend trait for user documents, named
//!   sections, append-only ledgers and operator-driven bulk migration
//! - **[`LocalStore`]**: file-backed provider with a TTL cache, debounced
//!   writes, backup-on-overwrite and idempotent ledger appends
//! - **[`MemoryStore`]**: hash-map provider with switchable availability,
//!   used as the stand-in remote in tests and tooling
//! - **[`Transaction`]**: snapshot/commit/rollback unit of work over a
//!   single user document, with resumable commits
//!
//! # Durability model
//!
//! Plain `save_user`/`save_section` on the local store are debounced: the
//! write becomes durable `debounce_interval` after the last save for that
//! key, and bursts collapse to a single disk write. The `*_now` variants
//! flush before returning. Reads are served from a TTL cache first, so a
//! caller always sees its own writes. Ledger appends are immediate and
//! idempotent by entry id.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tavern_core::UserId;
//! use tavern_store::{LocalStore, LocalStoreConfig, Transaction};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalStore::new(LocalStoreConfig::default())?);
//!
//! let mut tx = Transaction::begin(store, UserId::new("alice")?).await?;
//! tx.decr("gold", 50)?;
//! tx.incr("inventory.ale", 1)?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod local;
pub mod memory;
pub mod paths;
pub mod provider;
pub mod transaction;

pub use error::{Result, StoreError};
pub use local::{LocalStore, LocalStoreConfig};
pub use memory::MemoryStore;
pub use provider::{MigrationReport, Provider};
pub use transaction::Transaction;
