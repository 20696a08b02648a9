//! Common test utilities for tavern store integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use tavern_core::{Catalog, Document, Item, LedgerEntry, UserId};
use tavern_service::{ServiceConfig, StoreService};
use tavern_store::{
    LocalStore, LocalStoreConfig, MemoryStore, MigrationReport, Provider, StoreError,
};

/// Test harness: a service over a fresh temp-dir local store.
pub struct TestHarness {
    /// The service under test, shareable across spawned tasks.
    pub service: Arc<StoreService>,
    /// The backing local store, for direct seeding and inspection.
    pub local: Arc<LocalStore>,
    /// The config the service was built with.
    pub config: ServiceConfig,
    /// Temporary data directory (kept alive for the test duration).
    pub _temp_dir: TempDir,
}

/// Harness over local storage only, catalog seeded with `items`.
pub async fn harness(items: Vec<Item>) -> TestHarness {
    harness_with(items, None, |_| {}).await
}

/// Harness with an optional remote provider and a config tweak.
pub async fn harness_with(
    items: Vec<Item>,
    remote: Option<Arc<dyn Provider>>,
    tweak: impl FnOnce(&mut ServiceConfig),
) -> TestHarness {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store_config = LocalStoreConfig {
        data_dir: temp_dir.path().to_path_buf(),
        debounce_interval: Duration::from_millis(20),
        cache_ttl: Duration::from_millis(200),
    };
    let local = Arc::new(LocalStore::new(store_config).expect("Failed to open local store"));

    if !items.is_empty() {
        let mut catalog = Catalog::default();
        for item in items {
            catalog.insert(item);
        }
        local
            .save_section_now("store_catalog", &catalog.to_document())
            .await
            .expect("Failed to seed catalog");
    }

    let mut config = ServiceConfig {
        data_dir: temp_dir.path().to_path_buf(),
        queue_file: temp_dir.path().join("pending_transactions.json"),
        ..ServiceConfig::default()
    };
    tweak(&mut config);

    let service = StoreService::new(Arc::clone(&local), remote, config.clone())
        .await
        .expect("Failed to build service");
    TestHarness {
        service: Arc::new(service),
        local,
        config,
        _temp_dir: temp_dir,
    }
}

// ============================================================================
// Users and items
// ============================================================================

pub fn user(id: &str) -> UserId {
    UserId::new(id).expect("valid user id")
}

/// Write a user document with the given gold balance straight to disk.
pub async fn seed_user(local: &LocalStore, id: &UserId, gold: i64) {
    local
        .save_user_now(id, &profile_doc(id, gold))
        .await
        .expect("Failed to seed user");
}

/// A plain profile document with `gold` in the wallet.
pub fn profile_doc(id: &UserId, gold: i64) -> Document {
    let value = serde_json::json!({
        "user_id": id.as_str(),
        "gold": gold,
        "gems": 100,
        "inventory": {},
        "version": 1,
    });
    value.as_object().expect("object").clone()
}

/// 500 gold, unlimited stock, consumable.
pub fn potion() -> Item {
    let mut item = Item::new("health_potion", "Health Potion");
    item.description = "Restores 50 HP".to_string();
    item.categories = vec!["consumable".to_string()];
    item.base_price.insert("gold".to_string(), 500);
    item
}

/// 1200 gold, 3 in stock, loot.
pub fn sword() -> Item {
    let mut item = Item::new("iron_sword", "Iron Sword");
    item.categories = vec!["loot".to_string(), "weapon".to_string()];
    item.base_price.insert("gold".to_string(), 1200);
    item.stock = Some(3);
    item
}

/// 100 gold, capped at one per user.
pub fn trophy() -> Item {
    let mut item = Item::new("tavern_trophy", "Tavern Trophy");
    item.base_price.insert("gold".to_string(), 100);
    item.max_per_user = Some(1);
    item
}

// ============================================================================
// Rigged remote providers
// ============================================================================

/// Remote provider with call counters and a switch that fails every write.
///
/// Reads delegate to the inner [`MemoryStore`]; flip `inner.set_offline`
/// to fail reads as well.
pub struct RiggedRemote {
    pub inner: MemoryStore,
    pub gets: AtomicUsize,
    pub saves: AtomicUsize,
    pub appends: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RiggedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            gets: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Make every write call fail with `ProviderUnavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn write_gate(&self) -> tavern_store::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::ProviderUnavailable(
                "injected write failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for RiggedRemote {
    async fn get_user(&self, user_id: &UserId) -> tavern_store::Result<Option<Document>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_user(user_id).await
    }

    async fn save_user(&self, user_id: &UserId, doc: &Document) -> tavern_store::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.write_gate()?;
        self.inner.save_user(user_id, doc).await
    }

    async fn get_section(&self, section: &str) -> tavern_store::Result<Option<Document>> {
        self.inner.get_section(section).await
    }

    async fn save_section(&self, section: &str, doc: &Document) -> tavern_store::Result<()> {
        self.write_gate()?;
        self.inner.save_section(section, doc).await
    }

    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> tavern_store::Result<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.write_gate()?;
        self.inner.append_ledger(name, entry).await
    }

    async fn read_ledger(&self, name: &str) -> tavern_store::Result<Vec<LedgerEntry>> {
        self.inner.read_ledger(name).await
    }

    async fn sync_local_to_remote(&self) -> tavern_store::Result<MigrationReport> {
        self.inner.sync_local_to_remote().await
    }

    async fn sync_remote_to_local(&self) -> tavern_store::Result<MigrationReport> {
        self.inner.sync_remote_to_local().await
    }

    async fn migrate_local_to_remote(
        &self,
        dry_run: bool,
    ) -> tavern_store::Result<MigrationReport> {
        self.inner.migrate_local_to_remote(dry_run).await
    }
}

/// Remote provider that parks one chosen `get_user` call until released,
/// signalling arrival through a channel. Used to hold a purchase open
/// between its version capture and its apply step.
pub struct GatedRemote {
    pub inner: MemoryStore,
    gate_call: usize,
    calls: AtomicUsize,
    entered_tx: tokio::sync::mpsc::UnboundedSender<()>,
    release: tokio::sync::Semaphore,
}

impl GatedRemote {
    /// Gate the `gate_call`-th `get_user` (0-based). Returns the provider
    /// and a receiver that fires when the gated call arrives.
    pub fn new(gate_call: usize) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let (entered_tx, entered_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: MemoryStore::new(),
                gate_call,
                calls: AtomicUsize::new(0),
                entered_tx,
                release: tokio::sync::Semaphore::new(0),
            }),
            entered_rx,
        )
    }

    /// Let the parked call proceed.
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl Provider for GatedRemote {
    async fn get_user(&self, user_id: &UserId) -> tavern_store::Result<Option<Document>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.gate_call {
            let _ = self.entered_tx.send(());
            let permit = self
                .release
                .acquire()
                .await
                .map_err(|_| StoreError::ProviderUnavailable("gate closed".to_string()))?;
            permit.forget();
        }
        self.inner.get_user(user_id).await
    }

    async fn save_user(&self, user_id: &UserId, doc: &Document) -> tavern_store::Result<()> {
        self.inner.save_user(user_id, doc).await
    }

    async fn get_section(&self, section: &str) -> tavern_store::Result<Option<Document>> {
        self.inner.get_section(section).await
    }

    async fn save_section(&self, section: &str, doc: &Document) -> tavern_store::Result<()> {
        self.inner.save_section(section, doc).await
    }

    async fn append_ledger(&self, name: &str, entry: &LedgerEntry) -> tavern_store::Result<()> {
        self.inner.append_ledger(name, entry).await
    }

    async fn read_ledger(&self, name: &str) -> tavern_store::Result<Vec<LedgerEntry>> {
        self.inner.read_ledger(name).await
    }

    async fn sync_local_to_remote(&self) -> tavern_store::Result<MigrationReport> {
        self.inner.sync_local_to_remote().await
    }

    async fn sync_remote_to_local(&self) -> tavern_store::Result<MigrationReport> {
        self.inner.sync_remote_to_local().await
    }

    async fn migrate_local_to_remote(
        &self,
        dry_run: bool,
    ) -> tavern_store::Result<MigrationReport> {
        self.inner.migrate_local_to_remote(dry_run).await
    }
}
