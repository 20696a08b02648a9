//! Purchase transaction records and outcomes.
//!
//! A [`PurchaseTransaction`] is the durable record of one purchase attempt,
//! from `Pending` through `Committed`, `Failed` or `PendingOffline`. Denied
//! preconditions never produce a transaction at all; they surface as a
//! [`PurchaseDenial`] inside a [`PurchaseResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::ids::{TxId, UserId};
use crate::pricing::PriceSnapshot;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of a purchase transaction.
///
/// `Pending` is the only initial state. `Committed` and `Failed` are
/// terminal; `PendingOffline` resolves to `Committed` during queue
/// reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created, not yet committed anywhere.
    Pending,
    /// Durably applied on the active provider.
    Committed,
    /// Rolled back; no state change survived.
    Failed,
    /// Applied locally, awaiting replay against the remote provider.
    PendingOffline,
}

// ============================================================================
// Transaction record
// ============================================================================

/// Durable record of one purchase.
///
/// Balance maps hold the balances for every currency the purchase touched
/// (in practice: the purchase currency), captured immediately before and
/// after the mutation. Reconciliation uses them as preconditions when
/// replaying the purchase against a provider that was offline at commit
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseTransaction {
    /// Unique transaction id; doubles as the ledger entry id.
    pub tx_id: TxId,

    /// Buyer.
    pub user_id: UserId,

    /// Item purchased.
    pub item_id: String,

    /// Units purchased.
    pub quantity: i64,

    /// Currency debited.
    pub currency: String,

    /// Exact price derivation at purchase time.
    pub price_snapshot: PriceSnapshot,

    /// Touched balances immediately before the mutation.
    pub pre_balances: BTreeMap<String, i64>,

    /// Touched balances immediately after the mutation.
    pub post_balances: BTreeMap<String, i64>,

    /// Current lifecycle state.
    pub status: TransactionStatus,

    /// When the attempt was created.
    pub created_at: DateTime<Utc>,

    /// When the transaction reached `Committed`, if it has.
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,

    /// Why the transaction failed or is held in conflict, if it is.
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Whether the active provider has durably applied this transaction.
    #[serde(default)]
    pub provider_synced: bool,
}

impl PurchaseTransaction {
    /// Create a `Pending` transaction with a fresh id.
    ///
    /// The currency is taken from the price snapshot so a record can never
    /// disagree with its own quote.
    #[must_use]
    pub fn new(
        user_id: UserId,
        item_id: impl Into<String>,
        quantity: i64,
        price_snapshot: PriceSnapshot,
        pre_balances: BTreeMap<String, i64>,
        post_balances: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            tx_id: TxId::generate(),
            user_id,
            item_id: item_id.into(),
            quantity,
            currency: price_snapshot.currency.clone(),
            price_snapshot,
            pre_balances,
            post_balances,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            committed_at: None,
            failure_reason: None,
            provider_synced: true,
        }
    }

    /// Mark durably applied on the active provider.
    pub fn mark_committed(&mut self) {
        self.status = TransactionStatus::Committed;
        self.committed_at = Some(Utc::now());
        self.provider_synced = true;
    }

    /// Mark applied locally only, pending replay against the remote.
    pub fn mark_pending_offline(&mut self) {
        self.status = TransactionStatus::PendingOffline;
        self.provider_synced = false;
    }

    /// Mark rolled back with a reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.provider_synced = false;
    }
}

// ============================================================================
// Offline queue entry
// ============================================================================

/// A purchase waiting in the offline queue for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOfflineTransaction {
    /// The locally-applied purchase, status `PendingOffline`.
    #[serde(flatten)]
    pub transaction: PurchaseTransaction,

    /// Queue file this entry was written to.
    pub queue_file: PathBuf,

    /// Reconciliation attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingOfflineTransaction {
    /// Wrap a transaction for the queue, forcing its status to
    /// `PendingOffline`.
    #[must_use]
    pub fn new(mut transaction: PurchaseTransaction, queue_file: PathBuf) -> Self {
        transaction.mark_pending_offline();
        Self {
            transaction,
            queue_file,
            retry_count: 0,
        }
    }
}

// ============================================================================
// Denials
// ============================================================================

/// A purchase precondition that did not hold.
///
/// Denials are expected outcomes, not errors: they arrive inside an
/// `Ok(PurchaseResult)` and leave no trace in user, catalog or ledger
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PurchaseDenial {
    /// No such item in the catalog.
    ItemNotFound,

    /// Finite stock cannot cover the requested quantity.
    InsufficientStock {
        /// Units left in stock.
        available: i64,
        /// Units requested.
        requested: i64,
    },

    /// Balance cannot cover the quoted price.
    InsufficientFunds {
        /// Current balance in the purchase currency.
        balance: i64,
        /// Quoted final price.
        required: i64,
    },

    /// The purchase would exceed the item's per-user ownership cap.
    PurchaseLimitReached {
        /// The item's `max_per_user`.
        cap: i64,
        /// Units the user already owns.
        owned: i64,
        /// Units requested.
        requested: i64,
    },

    /// The item changed under us between quote and apply.
    VersionConflict {
        /// Item version captured at quote time.
        expected: i64,
        /// Item version found at apply time.
        actual: i64,
    },
}

impl fmt::Display for PurchaseDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ItemNotFound => write!(f, "Item not found"),
            Self::InsufficientStock { .. } => write!(f, "Not enough stock"),
            Self::InsufficientFunds { .. } => write!(f, "Insufficient funds"),
            Self::PurchaseLimitReached { .. } => write!(f, "Purchase limit reached"),
            Self::VersionConflict { .. } => {
                write!(f, "Item changed during purchase, please retry")
            }
        }
    }
}

// ============================================================================
// Result
// ============================================================================

/// Outcome of a purchase attempt, granted or denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseResult {
    /// Whether the purchase was applied (possibly offline).
    pub success: bool,

    /// Transaction id, when one was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,

    /// Human-readable outcome line for the chat layer.
    pub message: String,

    /// Balances after the purchase, when granted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balances: Option<BTreeMap<String, i64>>,

    /// The failed precondition, when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<PurchaseDenial>,
}

impl PurchaseResult {
    /// A granted purchase.
    #[must_use]
    pub fn granted(
        tx_id: TxId,
        message: impl Into<String>,
        new_balances: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            success: true,
            tx_id: Some(tx_id),
            message: message.into(),
            new_balances: Some(new_balances),
            denial: None,
        }
    }

    /// A denied purchase; the message is the denial's display form.
    #[must_use]
    pub fn denied(denial: PurchaseDenial) -> Self {
        Self {
            success: false,
            tx_id: None,
            message: denial.to_string(),
            new_balances: None,
            denial: Some(denial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Item;
    use crate::pricing::quote;

    fn test_transaction() -> PurchaseTransaction {
        let mut item = Item::new("health_potion", "Health Potion");
        item.base_price.insert("gold".to_string(), 500);
        let snapshot = quote(&item, 2, None, "gold", 1.0);
        PurchaseTransaction::new(
            UserId::new("alice").unwrap(),
            "health_potion",
            2,
            snapshot,
            BTreeMap::from([("gold".to_string(), 5000)]),
            BTreeMap::from([("gold".to_string(), 4000)]),
        )
    }

    #[test]
    fn new_transaction_is_pending() {
        let tx = test_transaction();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.currency, "gold");
        assert!(tx.committed_at.is_none());
    }

    #[test]
    fn committed_transition_stamps_time_and_sync() {
        let mut tx = test_transaction();
        tx.provider_synced = false;
        tx.mark_committed();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert!(tx.committed_at.is_some());
        assert!(tx.provider_synced);
    }

    #[test]
    fn failed_transition_records_reason() {
        let mut tx = test_transaction();
        tx.mark_failed("catalog write refused");
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason.as_deref(), Some("catalog write refused"));
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(TransactionStatus::PendingOffline).unwrap(),
            serde_json::json!("PENDING_OFFLINE")
        );
        assert_eq!(
            serde_json::to_value(TransactionStatus::Committed).unwrap(),
            serde_json::json!("COMMITTED")
        );
    }

    #[test]
    fn queue_entry_forces_offline_status_and_roundtrips() {
        let entry = PendingOfflineTransaction::new(
            test_transaction(),
            PathBuf::from("data/pending_transactions.json"),
        );
        assert_eq!(entry.transaction.status, TransactionStatus::PendingOffline);
        assert!(!entry.transaction.provider_synced);

        let raw = serde_json::to_string(&entry).unwrap();
        let parsed: PendingOfflineTransaction = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.transaction.tx_id, entry.transaction.tx_id);
        assert_eq!(parsed.retry_count, 0);
        // flattened: transaction fields sit at the top level of the entry
        assert!(raw.contains("\"status\":\"PENDING_OFFLINE\""));
    }

    #[test]
    fn denial_messages_match_chat_copy() {
        assert_eq!(PurchaseDenial::ItemNotFound.to_string(), "Item not found");
        assert_eq!(
            PurchaseDenial::InsufficientStock {
                available: 1,
                requested: 3
            }
            .to_string(),
            "Not enough stock"
        );
        assert_eq!(
            PurchaseDenial::InsufficientFunds {
                balance: 10,
                required: 500
            }
            .to_string(),
            "Insufficient funds"
        );
    }

    #[test]
    fn denied_result_carries_structured_reason() {
        let result = PurchaseResult::denied(PurchaseDenial::InsufficientFunds {
            balance: 10,
            required: 500,
        });
        assert!(!result.success);
        assert!(result.tx_id.is_none());
        assert_eq!(result.message, "Insufficient funds");

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["denial"]["reason"], "insufficient_funds");
        assert_eq!(value["denial"]["required"], 500);
    }
}
