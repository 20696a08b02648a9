//! Core types and pure computation for the tavern economy backend.
//!
//! This crate provides the foundational types used throughout the tavern platform:
//!
//! - **Identifiers**: `UserId`, `TxId`
//! - **Documents**: the schemaless `Document` record plus lenient field accessors
//! - **Catalog**: `Item`, `Catalog`, `VipTier`
//! - **Pricing**: `quote`, `PriceSnapshot`
//! - **Purchases**: `PurchaseTransaction`, `PurchaseResult`, `PurchaseDenial`
//! - **Ledger**: `LedgerEntry`
//!
//! # Currency Unit
//!
//! Balances and prices are integer currency units (`i64`) keyed by a currency
//! name (e.g. `"gold"`, `"gems"`). Price math floors to an integer at the
//! unit-price step so a quoted price is always exactly payable.
//!
//! No I/O happens in this crate; persistence lives in `tavern-store`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod document;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod purchase;

pub use catalog::{Catalog, CatalogPage, Item, VipTier};
pub use document::Document;
pub use ids::{IdError, TxId, UserId};
pub use ledger::LedgerEntry;
pub use pricing::{quote, PriceSnapshot};
pub use purchase::{
    PendingOfflineTransaction, PurchaseDenial, PurchaseResult, PurchaseTransaction,
    TransactionStatus,
};
