//! The store service.
//!
//! [`StoreService`] owns the catalog, prices purchases, runs the purchase
//! flow against whichever provider is active, and reconciles the offline
//! queue. It is the only place catalog state is mutated; user state is
//! mutated through [`Transaction`] only.
//!
//! Availability beats immediate consistency on the purchase path: a commit
//! that fails because the provider is unreachable still reports success,
//! backed by a locally durable copy and a queue entry for later replay.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;

use tavern_core::{
    document, quote, Catalog, CatalogPage, Document, Item, LedgerEntry,
    PendingOfflineTransaction, PriceSnapshot, PurchaseDenial, PurchaseResult,
    PurchaseTransaction, UserId, VipTier,
};
use tavern_store::{LocalStore, Provider, StoreError, Transaction};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::queue::{OfflineQueue, QueueSlot};

/// Chat copy for a purchase applied on the active provider.
const MSG_PURCHASED: &str = "Purchase successful";
/// Chat copy for a purchase applied locally with the provider unreachable.
const MSG_QUEUED: &str =
    "Purchase recorded locally (offline). Will sync when the provider is available.";

// ============================================================================
// Sync report
// ============================================================================

/// Outcome of one reconciliation pass over the offline queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Entries applied (or verified already applied) and removed.
    pub applied: usize,
    /// Entries kept because the remote is still unreachable or unparseable.
    pub failed: usize,
    /// Entries kept because remote state matched neither precondition.
    pub conflicts: usize,
    /// One line per kept entry, for the operator.
    pub errors: Vec<String>,
}

impl SyncReport {
    /// Whether every queued entry was resolved.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0
    }
}

/// Outcome of reconciling one queue entry.
enum Reconciled {
    Applied,
    StillOffline(Box<PendingOfflineTransaction>, String),
    Conflict(Box<PendingOfflineTransaction>, String),
}

/// Resolved provider and profile for one purchase attempt.
struct EnsuredUser {
    provider: Arc<dyn Provider>,
    profile: Document,
    created: bool,
}

// ============================================================================
// Service
// ============================================================================

/// Catalog, pricing, purchases, admin mutations and queue reconciliation.
///
/// The catalog lives behind a coarse `std::sync::Mutex`, never held across
/// an await. `single_tenant` starts from config and is flipped permanently
/// by auto-fallback when the remote proves unreachable. The offline queue
/// is guarded by a `tokio::sync::Mutex` so a whole reconciliation pass is
/// atomic with respect to new offline purchases.
pub struct StoreService {
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn Provider>>,
    config: ServiceConfig,
    catalog: Mutex<Catalog>,
    single_tenant: AtomicBool,
    queue: tokio::sync::Mutex<OfflineQueue>,
}

impl StoreService {
    /// Build a service over `local`, optionally backed by a remote
    /// provider, loading the catalog from its section.
    ///
    /// A missing catalog section starts the service with an empty catalog.
    ///
    /// # Errors
    /// Store failures reading the catalog section; `Catalog` when the
    /// section exists but is not catalog-shaped.
    pub async fn new(
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn Provider>>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let catalog = match local.get_section(&config.catalog_section).await? {
            Some(doc) => {
                if doc.get("items").is_some_and(|v| !v.is_object()) {
                    return Err(ServiceError::Catalog(format!(
                        "section {} has a non-object items field",
                        config.catalog_section
                    )));
                }
                Catalog::from_document(&doc)
            }
            None => {
                tracing::warn!(
                    section = %config.catalog_section,
                    "no catalog section on disk, starting with an empty catalog"
                );
                Catalog::default()
            }
        };
        tracing::info!(
            items = catalog.items.len(),
            single_tenant = config.single_tenant,
            has_remote = remote.is_some(),
            "store service ready"
        );
        let queue = OfflineQueue::new(config.queue_file.clone());
        Ok(Self {
            local,
            remote,
            catalog: Mutex::new(catalog),
            single_tenant: AtomicBool::new(config.single_tenant),
            queue: tokio::sync::Mutex::new(queue),
            config,
        })
    }

    /// Whether the service is operating against local storage only.
    #[must_use]
    pub fn is_single_tenant(&self) -> bool {
        self.single_tenant.load(Ordering::SeqCst)
    }

    /// Number of purchases waiting in the offline queue.
    ///
    /// # Errors
    /// Store failures reading the queue file.
    pub async fn pending_count(&self) -> Result<usize> {
        let queue = self.queue.lock().await;
        Ok(queue.count().await?)
    }

    // ========================================================================
    // Catalog reads
    // ========================================================================

    /// A page of catalog items, optionally filtered by category.
    #[must_use]
    pub fn get_catalog(
        &self,
        page: usize,
        per_page: usize,
        category: Option<&str>,
    ) -> CatalogPage {
        self.catalog_lock().page(page, per_page, category)
    }

    /// A catalog item by id.
    #[must_use]
    pub fn get_item(&self, item_id: &str) -> Option<Item> {
        self.catalog_lock().get_item(item_id).cloned()
    }

    /// Quote a purchase without committing to it.
    ///
    /// # Errors
    /// `ItemNotFound` when the catalog has no such item.
    pub fn preview_price(
        &self,
        item_id: &str,
        quantity: i64,
        vip: Option<&VipTier>,
        currency: &str,
        exchange_rate: f64,
    ) -> Result<PriceSnapshot> {
        let catalog = self.catalog_lock();
        let item = catalog
            .get_item(item_id)
            .ok_or_else(|| ServiceError::ItemNotFound(item_id.to_string()))?;
        Ok(quote(item, quantity, vip, currency, exchange_rate))
    }

    // ========================================================================
    // Purchase flow
    // ========================================================================

    /// Purchase `quantity` of `item_id` for `user_id`, paying in `currency`.
    ///
    /// Precondition failures come back as a denial inside `Ok`; an
    /// unreachable provider at commit time still yields success, with the
    /// purchase applied locally and queued for reconciliation.
    ///
    /// # Errors
    /// Store failures outside the provider-availability case, and invalid
    /// inputs.
    pub async fn purchase_item(
        &self,
        user_id: &UserId,
        item_id: &str,
        quantity: i64,
        currency: &str,
        vip: Option<&VipTier>,
    ) -> Result<PurchaseResult> {
        let quantity = quantity.max(1);
        let EnsuredUser {
            provider,
            profile,
            created,
        } = self.ensure_user(user_id).await?;

        // Pre-checks under the catalog lock. The item version captured here
        // is the compare value for the swap at apply time.
        let (snapshot, expected_version) = {
            let catalog = self.catalog_lock();
            let Some(item) = catalog.get_item(item_id) else {
                return Ok(PurchaseResult::denied(PurchaseDenial::ItemNotFound));
            };
            if let Some(cap) = item.max_per_user {
                let owned = document::get_i64(&profile, &format!("inventory.{item_id}"));
                if owned + quantity > cap {
                    return Ok(PurchaseResult::denied(
                        PurchaseDenial::PurchaseLimitReached {
                            cap,
                            owned,
                            requested: quantity,
                        },
                    ));
                }
            }
            if let Some(stock) = item.stock {
                if stock < quantity {
                    return Ok(PurchaseResult::denied(PurchaseDenial::InsufficientStock {
                        available: stock,
                        requested: quantity,
                    }));
                }
            }
            (quote(item, quantity, vip, currency, 1.0), item.version)
        };

        // A profile we created this call is not yet visible through a remote
        // provider, so the transaction starts from it directly. Existing
        // users re-read through the provider; if that read fails on
        // availability the checked snapshot stands in and the commit failure
        // path takes over from there.
        let mut tx = if created {
            Transaction::from_snapshot(Arc::clone(&provider), user_id.clone(), profile)
        } else {
            match Transaction::begin(Arc::clone(&provider), user_id.clone()).await {
                Ok(tx) => tx,
                Err(StoreError::ProviderUnavailable(reason)) => {
                    tracing::warn!(
                        reason,
                        user_id = %user_id,
                        "provider read failed opening the transaction, using the checked snapshot"
                    );
                    Transaction::from_snapshot(Arc::clone(&provider), user_id.clone(), profile)
                }
                Err(error) => return Err(error.into()),
            }
        };

        let balance = document::get_i64(tx.working(), currency);
        if balance < snapshot.final_price {
            return Ok(PurchaseResult::denied(PurchaseDenial::InsufficientFunds {
                balance,
                required: snapshot.final_price,
            }));
        }

        let pre_balances = self.balances_of(tx.working(), currency);
        tx.decr(currency, snapshot.final_price)?;
        tx.incr(&format!("inventory.{item_id}"), quantity)?;
        tx.incr("version", 1)?;
        let post_balances = self.balances_of(tx.working(), currency);

        let mut purchase = PurchaseTransaction::new(
            user_id.clone(),
            item_id,
            quantity,
            snapshot,
            pre_balances,
            post_balances.clone(),
        );
        tx.add_ledger_entry(
            self.config.purchase_ledger.clone(),
            LedgerEntry::purchase(&purchase),
        )?;

        // Apply the catalog side under the lock, compare-and-swap on the
        // captured version. A conflict is a denial, never a silent
        // overwrite.
        let prior_item = {
            let mut catalog = self.catalog_lock();
            let Some(item) = catalog.items.get_mut(item_id) else {
                return Ok(PurchaseResult::denied(PurchaseDenial::ItemNotFound));
            };
            if item.version != expected_version {
                return Ok(PurchaseResult::denied(PurchaseDenial::VersionConflict {
                    expected: expected_version,
                    actual: item.version,
                }));
            }
            let prior = item.clone();
            if let Some(stock) = item.stock.as_mut() {
                *stock -= quantity;
            }
            item.total_sold += quantity;
            item.version += 1;
            catalog.touch();
            prior
        };

        match tx.commit().await {
            Ok(()) => {
                if let Err(error) = self.persist_catalog().await {
                    tracing::error!(%error, "catalog persistence failed after a committed purchase");
                }
                purchase.mark_committed();
                tracing::info!(
                    user_id = %user_id,
                    item_id,
                    quantity,
                    tx_id = %purchase.tx_id,
                    amount = purchase.price_snapshot.final_price,
                    "purchase committed"
                );
                Ok(PurchaseResult::granted(
                    purchase.tx_id,
                    MSG_PURCHASED,
                    post_balances,
                ))
            }
            Err(StoreError::ProviderUnavailable(reason)) => {
                tracing::warn!(
                    reason,
                    tx_id = %purchase.tx_id,
                    "provider unreachable at commit, recording the purchase offline"
                );
                self.record_offline(purchase, tx.working().clone(), post_balances)
                    .await
            }
            Err(error) => {
                self.revert_catalog_mutation(item_id, &prior_item);
                Err(error.into())
            }
        }
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    /// Add `amount` to an item's stock; unlimited items start from 0.
    ///
    /// Persists the catalog before returning the updated item.
    ///
    /// # Errors
    /// `ItemNotFound`, or store failures persisting the catalog.
    pub async fn restock_item(&self, admin: &UserId, item_id: &str, amount: i64) -> Result<Item> {
        let updated = {
            let mut catalog = self.catalog_lock();
            let item = catalog
                .items
                .get_mut(item_id)
                .ok_or_else(|| ServiceError::ItemNotFound(item_id.to_string()))?;
            *item.stock.get_or_insert(0) += amount;
            item.version += 1;
            let updated = item.clone();
            catalog.touch();
            updated
        };
        self.persist_catalog().await?;
        tracing::info!(
            admin = %admin,
            item_id,
            amount,
            stock = updated.stock,
            version = updated.version,
            "restocked item"
        );
        Ok(updated)
    }

    /// Replace an item's per-currency price map.
    ///
    /// Persists the catalog before returning the updated item.
    ///
    /// # Errors
    /// `ItemNotFound`, or store failures persisting the catalog.
    pub async fn set_price(
        &self,
        admin: &UserId,
        item_id: &str,
        prices: BTreeMap<String, i64>,
    ) -> Result<Item> {
        let updated = {
            let mut catalog = self.catalog_lock();
            let item = catalog
                .items
                .get_mut(item_id)
                .ok_or_else(|| ServiceError::ItemNotFound(item_id.to_string()))?;
            item.base_price = prices;
            item.version += 1;
            let updated = item.clone();
            catalog.touch();
            updated
        };
        self.persist_catalog().await?;
        tracing::info!(admin = %admin, item_id, version = updated.version, "updated item prices");
        Ok(updated)
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    /// Purchase-ledger entries for one user, in append order.
    ///
    /// Reads through the active provider, the same place purchases commit.
    ///
    /// # Errors
    /// Store failures reading the ledger.
    pub async fn get_ledger(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let entries = self
            .active_provider()
            .read_ledger(&self.config.purchase_ledger)
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.user_id() == Some(user_id.as_str()))
            .skip(offset)
            .take(limit)
            .collect())
    }

    // ========================================================================
    // Offline reconciliation
    // ========================================================================

    /// Replay queued offline purchases against the remote provider.
    ///
    /// Each entry is checked against remote state before anything is
    /// written: an entry whose recorded post-balance already matches is
    /// dropped as applied, one whose pre-balance matches is replayed, and
    /// anything else is kept as a conflict for manual reconciliation. Sync
    /// always talks to the configured remote even after a demotion; the
    /// queue cannot drain otherwise. Running on an empty or fully-resolved
    /// queue is a no-op.
    ///
    /// # Errors
    /// Store failures reading or rewriting the queue file itself. Per-entry
    /// failures are reported, not raised.
    pub async fn sync_pending_transactions(&self) -> Result<SyncReport> {
        let queue = self.queue.lock().await;
        let slots = queue.load().await?;
        if slots.is_empty() {
            return Ok(SyncReport::default());
        }

        let mut report = SyncReport::default();
        let mut remainder: Vec<Value> = Vec::new();
        for slot in slots {
            match slot {
                QueueSlot::Malformed(raw) => {
                    report.failed += 1;
                    report
                        .errors
                        .push("unparseable queue entry retained".to_string());
                    remainder.push(raw);
                }
                QueueSlot::Parsed(entry) => match self.reconcile_entry(*entry).await {
                    Reconciled::Applied => report.applied += 1,
                    Reconciled::StillOffline(entry, reason) => {
                        report.failed += 1;
                        report.errors.push(reason);
                        remainder.push(queue_value(&queue, &entry)?);
                    }
                    Reconciled::Conflict(entry, reason) => {
                        report.conflicts += 1;
                        report.errors.push(reason);
                        remainder.push(queue_value(&queue, &entry)?);
                    }
                },
            }
        }

        queue.rewrite(&remainder).await?;
        tracing::info!(
            applied = report.applied,
            failed = report.failed,
            conflicts = report.conflicts,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_entry(&self, mut entry: PendingOfflineTransaction) -> Reconciled {
        let tx_id = entry.transaction.tx_id;
        let Some(remote) = &self.remote else {
            // Local state already holds the purchase; there is nothing to
            // replay it against.
            tracing::debug!(%tx_id, "no remote configured, queue entry is final locally");
            return Reconciled::Applied;
        };

        let looked_up = match remote.get_user(&entry.transaction.user_id).await {
            Ok(doc) => doc,
            Err(error) => {
                entry.retry_count += 1;
                let reason = format!("{tx_id}: provider still unavailable: {error}");
                return Reconciled::StillOffline(Box::new(entry), reason);
            }
        };

        let currency = entry.transaction.currency.clone();
        let pre = entry
            .transaction
            .pre_balances
            .get(&currency)
            .copied()
            .unwrap_or(0);
        let post = entry
            .transaction
            .post_balances
            .get(&currency)
            .copied()
            .unwrap_or(0);
        let mut remote_doc = looked_up.unwrap_or_default();
        let remote_balance = document::get_i64(&remote_doc, &currency);

        if remote_balance == post {
            // Already applied remotely. The idempotent append closes a
            // ledger gap if the earlier commit died between write and
            // append.
            let ledger_entry = LedgerEntry::purchase(&entry.transaction);
            if let Err(error) = remote
                .append_ledger(&self.config.purchase_ledger, &ledger_entry)
                .await
            {
                tracing::warn!(%tx_id, %error, "ledger check failed for an already-applied entry");
            }
            tracing::info!(%tx_id, "queue entry was already applied remotely");
            return Reconciled::Applied;
        }

        if remote_balance == pre {
            document::set(&mut remote_doc, &currency, Value::from(post));
            document::incr_i64(
                &mut remote_doc,
                &format!("inventory.{}", entry.transaction.item_id),
                entry.transaction.quantity,
            );
            document::incr_i64(&mut remote_doc, "version", 1);
            if let Err(error) = remote.save_user(&entry.transaction.user_id, &remote_doc).await {
                entry.retry_count += 1;
                let reason = format!("{tx_id}: replay failed: {error}");
                return Reconciled::StillOffline(Box::new(entry), reason);
            }
            let ledger_entry = LedgerEntry::purchase(&entry.transaction);
            if let Err(error) = remote
                .append_ledger(&self.config.purchase_ledger, &ledger_entry)
                .await
            {
                tracing::warn!(%tx_id, %error, "replayed purchase but the ledger append failed");
            }
            tracing::info!(%tx_id, "replayed queued purchase against the remote");
            return Reconciled::Applied;
        }

        entry.retry_count += 1;
        let reason = format!(
            "{tx_id}: remote balance {remote_balance} matches neither pre {pre} nor post {post}"
        );
        entry.transaction.failure_reason = Some(reason.clone());
        tracing::warn!(
            %tx_id,
            remote_balance,
            pre,
            post,
            "queued purchase conflicts with remote state"
        );
        Reconciled::Conflict(Box::new(entry), reason)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn catalog_lock(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The provider purchases commit through right now.
    fn active_provider(&self) -> Arc<dyn Provider> {
        if !self.is_single_tenant() {
            if let Some(remote) = &self.remote {
                return Arc::clone(remote);
            }
        }
        Arc::clone(&self.local) as Arc<dyn Provider>
    }

    fn demote(&self, reason: &str) {
        if !self.single_tenant.swap(true, Ordering::SeqCst) {
            tracing::warn!(reason, "remote provider unavailable");
            tracing::info!("demoted to single-tenant mode for the rest of this process");
        }
    }

    /// Resolve the active provider and the user's profile, creating a
    /// default profile on first touch.
    async fn ensure_user(&self, user_id: &UserId) -> Result<EnsuredUser> {
        let provider = self.active_provider();
        let remote_active = !self.is_single_tenant() && self.remote.is_some();
        let looked_up = match provider.get_user(user_id).await {
            Ok(doc) => doc,
            Err(StoreError::ProviderUnavailable(reason)) if remote_active => {
                if self.config.auto_fallback {
                    self.demote(&reason);
                } else {
                    tracing::warn!(
                        reason,
                        user_id = %user_id,
                        "remote read failed, serving the local copy"
                    );
                }
                self.local.get_user(user_id).await?
            }
            Err(error) => return Err(error.into()),
        };
        // Re-resolved so a demotion above redirects the commit target too.
        let provider = self.active_provider();
        match looked_up {
            Some(profile) => Ok(EnsuredUser {
                provider,
                profile,
                created: false,
            }),
            None => {
                let profile = self.config.new_profile(user_id);
                self.local.save_user_now(user_id, &profile).await?;
                tracing::info!(user_id = %user_id, "created default profile");
                Ok(EnsuredUser {
                    provider,
                    profile,
                    created: true,
                })
            }
        }
    }

    /// Write an offline purchase to the queue and force the local view
    /// durable, then report success.
    async fn record_offline(
        &self,
        purchase: PurchaseTransaction,
        mutated: Document,
        post_balances: BTreeMap<String, i64>,
    ) -> Result<PurchaseResult> {
        let queue = self.queue.lock().await;
        let entry = PendingOfflineTransaction::new(purchase, queue.path().to_path_buf());
        queue.append(&entry).await?;

        self.local
            .save_user_now(&entry.transaction.user_id, &mutated)
            .await?;
        self.persist_catalog().await?;
        self.local
            .append_ledger(
                &self.config.purchase_ledger,
                &LedgerEntry::purchase(&entry.transaction),
            )
            .await?;

        if self.config.auto_fallback {
            self.demote("commit failed");
        }
        tracing::info!(
            tx_id = %entry.transaction.tx_id,
            user_id = %entry.transaction.user_id,
            "purchase queued for reconciliation"
        );
        Ok(PurchaseResult::granted(
            entry.transaction.tx_id,
            MSG_QUEUED,
            post_balances,
        ))
    }

    /// Balances for every configured currency, plus the purchase currency
    /// when it is not a configured one, read from `doc`.
    fn balances_of(&self, doc: &Document, currency: &str) -> BTreeMap<String, i64> {
        let mut balances: BTreeMap<String, i64> = self
            .config
            .currencies
            .iter()
            .map(|name| (name.clone(), document::get_i64(doc, name)))
            .collect();
        balances
            .entry(currency.to_string())
            .or_insert_with(|| document::get_i64(doc, currency));
        balances
    }

    async fn persist_catalog(&self) -> Result<()> {
        let doc = self.catalog_lock().to_document();
        self.local
            .save_section_now(&self.config.catalog_section, &doc)
            .await?;
        Ok(())
    }

    /// Undo the in-memory catalog mutation of a purchase whose commit
    /// failed hard. The durable catalog was not written yet, so memory is
    /// the only side to fix.
    fn revert_catalog_mutation(&self, item_id: &str, prior: &Item) {
        let mut catalog = self.catalog_lock();
        match catalog.items.get_mut(item_id) {
            Some(item) if item.version == prior.version + 1 => {
                *item = prior.clone();
            }
            _ => {
                tracing::warn!(item_id, "catalog moved after a failed commit, leaving it in place");
            }
        }
    }
}

fn queue_value(queue: &OfflineQueue, entry: &PendingOfflineTransaction) -> Result<Value> {
    serde_json::to_value(entry).map_err(|source| {
        ServiceError::Store(StoreError::Serialization {
            path: queue.path().to_path_buf(),
            source,
        })
    })
}
