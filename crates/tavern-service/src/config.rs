//! Service configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;

use tavern_core::{Document, UserId};

/// Section name the catalog is persisted under.
pub const CATALOG_SECTION: &str = "store_catalog";
/// Ledger name purchase facts are appended to.
pub const PURCHASE_LEDGER: &str = "purchases";
/// File name of the offline purchase queue, under the data directory.
pub const QUEUE_FILE_NAME: &str = "pending_transactions.json";

const DEFAULT_STARTING_GOLD: i64 = 10_000;
const DEFAULT_STARTING_GEMS: i64 = 100;

/// Settings for a [`StoreService`](crate::StoreService).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root data directory; the offline queue lives here.
    pub data_dir: PathBuf,

    /// Operate against local storage only, ignoring any remote provider.
    pub single_tenant: bool,

    /// Permanently demote to single-tenant after a remote failure.
    pub auto_fallback: bool,

    /// Currencies reported in purchase results.
    pub currencies: Vec<String>,

    /// Balances granted to a first-touch user profile.
    pub starting_balances: BTreeMap<String, i64>,

    /// Section name the catalog is stored under.
    pub catalog_section: String,

    /// Ledger name purchases are recorded to.
    pub purchase_ledger: String,

    /// Offline purchase queue file.
    pub queue_file: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            queue_file: data_dir.join(QUEUE_FILE_NAME),
            data_dir,
            single_tenant: false,
            auto_fallback: true,
            currencies: vec!["gold".to_string(), "gems".to_string()],
            starting_balances: BTreeMap::from([
                ("gold".to_string(), DEFAULT_STARTING_GOLD),
                ("gems".to_string(), DEFAULT_STARTING_GEMS),
            ]),
            catalog_section: CATALOG_SECTION.to_string(),
            purchase_ledger: PURCHASE_LEDGER.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Build a config from `TAVERN_DATA_DIR`, `TAVERN_SINGLE_TENANT` and
    /// `TAVERN_AUTO_FALLBACK`, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let data_dir: PathBuf = std::env::var("TAVERN_DATA_DIR")
            .unwrap_or_else(|_| "data".to_string())
            .into();
        Self {
            queue_file: data_dir.join(QUEUE_FILE_NAME),
            data_dir,
            single_tenant: std::env::var("TAVERN_SINGLE_TENANT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            auto_fallback: std::env::var("TAVERN_AUTO_FALLBACK")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            ..Self::default()
        }
    }

    /// The document a brand-new user starts with.
    #[must_use]
    pub fn new_profile(&self, user_id: &UserId) -> Document {
        let mut doc = Document::new();
        doc.insert(
            "user_id".to_string(),
            Value::String(user_id.as_str().to_string()),
        );
        for (currency, amount) in &self.starting_balances {
            doc.insert(currency.clone(), Value::from(*amount));
        }
        doc.insert(
            "inventory".to_string(),
            Value::Object(serde_json::Map::new()),
        );
        doc.insert("version".to_string(), Value::from(1));
        doc.insert(
            "created_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        doc
    }
}
