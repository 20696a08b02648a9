//! Append-only ledger entries.
//!
//! Entries are serialized one JSON object per line. The `entry_id` is the
//! idempotency key: appending the same id twice leaves a single line, which
//! is what makes transaction commit safely retryable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::purchase::PurchaseTransaction;

/// One immutable ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique idempotency key. Purchase entries reuse the transaction id.
    pub entry_id: String,

    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,

    /// Free-form event payload; purchase events carry a `type` of
    /// `"purchase"` and the purchase facts.
    pub event: Value,
}

impl LedgerEntry {
    /// Create an entry with an explicit id and payload.
    #[must_use]
    pub fn new(entry_id: impl Into<String>, event: Value) -> Self {
        Self {
            entry_id: entry_id.into(),
            recorded_at: Utc::now(),
            event,
        }
    }

    /// The purchase event for a transaction, keyed by its tx id.
    #[must_use]
    pub fn purchase(tx: &PurchaseTransaction) -> Self {
        Self::new(
            tx.tx_id.to_string(),
            json!({
                "type": "purchase",
                "user_id": tx.user_id.as_str(),
                "item_id": tx.item_id,
                "quantity": tx.quantity,
                "currency": tx.currency,
                "unit_price": tx.price_snapshot.unit_price,
                "amount": tx.price_snapshot.final_price,
            }),
        )
    }

    /// The user this entry belongs to, if the payload names one.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.event.get("user_id").and_then(Value::as_str)
    }
}
