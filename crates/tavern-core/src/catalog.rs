//! Store catalog types.
//!
//! The catalog is a named document section (`store_catalog`) holding every
//! purchasable item. Items carry their own optimistic-locking `version`
//! counter, bumped by every mutation (purchase, restock, price change).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::Document;

fn default_version() -> i64 {
    1
}

/// A purchasable catalog entry.
///
/// `stock: None` means unlimited. `base_price` maps currency name to the
/// un-inflated unit price; missing currencies price at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Unique item id (catalog key).
    pub id: String,

    /// Display name.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Category tags, used by VIP discount allowlists and catalog filters.
    #[serde(default)]
    pub categories: Vec<String>,

    /// Base price per currency.
    #[serde(default)]
    pub base_price: BTreeMap<String, i64>,

    /// Remaining finite stock; `None` = unlimited.
    #[serde(default)]
    pub stock: Option<i64>,

    /// Per-user ownership cap; `None` = uncapped.
    #[serde(default)]
    pub max_per_user: Option<i64>,

    /// Price inflation applied per unit sold (0.01 = +1% per sale).
    #[serde(default)]
    pub inflation_rate: f64,

    /// Cumulative units sold.
    #[serde(default)]
    pub total_sold: i64,

    /// Optimistic-locking counter; incremented by every mutation.
    #[serde(default = "default_version")]
    pub version: i64,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,

    /// When the item was first seeded.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Create a new item with default economic state.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            categories: Vec::new(),
            base_price: BTreeMap::new(),
            stock: None,
            max_per_user: None,
            inflation_rate: 0.0,
            total_sold: 0,
            version: default_version(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Base price in `currency`, or 0 if the item has no price for it.
    #[must_use]
    pub fn price_in(&self, currency: &str) -> i64 {
        self.base_price.get(currency).copied().unwrap_or(0)
    }
}

/// A VIP tier granting a purchase discount.
///
/// The discount applies to an item iff `categories` is empty (tier covers
/// everything) or shares at least one tag with the item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VipTier {
    /// Tier name.
    pub name: String,

    /// Discount fraction (0.10 == 10% off).
    #[serde(default)]
    pub discount_pct: f64,

    /// Category allowlist; empty = all items.
    #[serde(default)]
    pub categories: Vec<String>,
}

impl VipTier {
    /// Create a tier applying `discount_pct` to every item.
    #[must_use]
    pub fn new(name: impl Into<String>, discount_pct: f64) -> Self {
        Self {
            name: name.into(),
            discount_pct,
            categories: Vec::new(),
        }
    }

    /// Whether this tier's discount applies to `item`.
    #[must_use]
    pub fn applies_to(&self, item: &Item) -> bool {
        self.categories.is_empty()
            || self
                .categories
                .iter()
                .any(|c| item.categories.contains(c))
    }
}

/// One page of catalog items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPage {
    /// Items on this page, ordered by item id.
    pub items: Vec<Item>,
    /// 1-based page number.
    pub page: usize,
    /// Page size requested.
    pub per_page: usize,
    /// Total items matching the filter, across all pages.
    pub total: usize,
}

/// The full store catalog, persisted as a document section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Items keyed by id.
    pub items: BTreeMap<String, Item>,

    /// When the catalog was last mutated.
    pub last_updated: DateTime<Utc>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl Catalog {
    /// Look up an item by id.
    #[must_use]
    pub fn get_item(&self, item_id: &str) -> Option<&Item> {
        self.items.get(item_id)
    }

    /// Insert or replace an item, keyed by its id, and touch `last_updated`.
    pub fn insert(&mut self, item: Item) {
        self.items.insert(item.id.clone(), item);
        self.touch();
    }

    /// Record a mutation time.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// A page of items ordered by id, optionally filtered by category.
    ///
    /// `page` is 1-based and clamped to at least 1.
    #[must_use]
    pub fn page(&self, page: usize, per_page: usize, category: Option<&str>) -> CatalogPage {
        let page = page.max(1);
        let filtered: Vec<&Item> = self
            .items
            .values()
            .filter(|item| category.map_or(true, |c| item.categories.iter().any(|t| t == c)))
            .collect();
        let total = filtered.len();
        let start = (page - 1).saturating_mul(per_page);
        let items = filtered
            .into_iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        CatalogPage {
            items,
            page,
            per_page,
            total,
        }
    }

    /// Parse a catalog from its persisted document form.
    ///
    /// Items that fail to parse are skipped with a warning rather than
    /// failing the whole catalog; a bad seed entry must not take the store
    /// down.
    #[must_use]
    pub fn from_document(doc: &Document) -> Self {
        let mut items = BTreeMap::new();
        if let Some(raw_items) = doc.get("items").and_then(Value::as_object) {
            for (key, raw) in raw_items {
                match serde_json::from_value::<Item>(raw.clone()) {
                    Ok(item) => {
                        items.insert(item.id.clone(), item);
                    }
                    Err(error) => {
                        tracing::warn!(item_id = %key, %error, "skipping malformed catalog item");
                    }
                }
            }
        }
        let last_updated = doc
            .get("last_updated")
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
            .unwrap_or_else(Utc::now);
        Self {
            items,
            last_updated,
        }
    }

    /// Serialize the catalog to its persisted document form.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut items = serde_json::Map::new();
        for (id, item) in &self.items {
            match serde_json::to_value(item) {
                Ok(value) => {
                    items.insert(id.clone(), value);
                }
                Err(error) => {
                    tracing::warn!(item_id = %id, %error, "failed to serialize catalog item");
                }
            }
        }
        let mut doc = Document::new();
        doc.insert("items".to_string(), Value::Object(items));
        doc.insert(
            "last_updated".to_string(),
            Value::String(self.last_updated.to_rfc3339()),
        );
        doc
    }
}
