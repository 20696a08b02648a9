//! Game store service for the tavern economy backend.
//!
//! This crate sits between the chat command layer and the storage layer:
//!
//! - **[`StoreService`]**: catalog pages, price previews, the purchase
//!   flow, admin restock and price mutations, ledger reads and queue
//!   reconciliation
//! - **[`ServiceConfig`]**: environment-driven settings, including the
//!   starting balances granted to first-touch profiles
//! - **[`OfflineQueue`]**: the file of purchases applied locally while
//!   the provider was unreachable
//! - **[`SyncReport`]**: what a reconciliation pass applied, kept or
//!   flagged as conflicting
//!
//! # Availability over consistency
//!
//! A purchase whose commit fails on provider availability is not rolled
//! back. The mutated state is forced durable locally, the purchase joins
//! the offline queue, and the caller still sees success. A reconciliation
//! pass later replays each entry against the remote only when its recorded
//! pre-balance still holds there; anything else is kept in the queue for
//! manual review rather than blindly overwritten.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tavern_core::UserId;
//! use tavern_service::{ServiceConfig, StoreService};
//! use tavern_store::{LocalStore, LocalStoreConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let local = Arc::new(LocalStore::new(LocalStoreConfig::from_env())?);
//! let service = StoreService::new(local, None, ServiceConfig::from_env()).await?;
//!
//! let buyer = UserId::new("1344603209829974016")?;
//! let result = service
//!     .purchase_item(&buyer, "health_potion", 1, "gold", None)
//!     .await?;
//! println!("{}", result.message);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod queue;
pub mod service;

pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use queue::{OfflineQueue, QueueSlot};
pub use service::{StoreService, SyncReport};
