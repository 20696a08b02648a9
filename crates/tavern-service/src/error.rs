//! Service error types.

use thiserror::Error;

use tavern_core::IdError;
use tavern_store::StoreError;

/// Convenience alias for service results.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors produced by the store service.
///
/// Purchase precondition failures are not here: they are expected outcomes
/// and travel as `PurchaseDenial` inside an `Ok(PurchaseResult)`.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The catalog has no item with this id.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// The storage layer failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An identifier failed validation.
    #[error("invalid id: {0}")]
    Id(#[from] IdError),

    /// The catalog section could not be loaded or persisted.
    #[error("catalog error: {0}")]
    Catalog(String),
}
