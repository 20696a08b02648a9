//! Pure pricing computation.
//!
//! Pricing is a deterministic derivation from catalog state; no I/O and no
//! clock dependence beyond stamping `computed_at`. The same item, tier and
//! arguments always quote the same price, which is what lets a quote be
//! persisted inside a transaction and replayed later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Item, VipTier};

/// Immutable record of how a price was derived.
///
/// Persisted verbatim inside each purchase transaction so the ledger can
/// answer "why did this cost 900" long after the catalog moved on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Item the quote is for.
    pub item_id: String,

    /// Currency the price is denominated in.
    pub currency: String,

    /// Un-inflated per-unit base price at quote time.
    pub base_price: i64,

    /// `(1 + inflation_rate) ^ total_sold` at quote time.
    pub inflation_multiplier: f64,

    /// Applied VIP discount fraction (0 when no tier matched).
    pub vip_discount: f64,

    /// Currency exchange multiplier.
    pub exchange_rate: f64,

    /// Final per-unit price after inflation, discount and exchange.
    pub unit_price: i64,

    /// `unit_price * quantity`.
    pub final_price: i64,

    /// When the quote was computed.
    pub computed_at: DateTime<Utc>,
}

/// Quote the price of `quantity` units of `item` in `currency`.
///
/// The derivation, in order:
/// 1. base price for `currency` (absent prices quote as 0);
/// 2. inflation: `(1 + inflation_rate) ^ total_sold`;
/// 3. VIP discount, iff `vip` is given and applies to the item's categories;
/// 4. exchange rate multiplier;
/// 5. per-unit price floored to whole currency units, never below 0;
/// 6. total for `max(1, quantity)` units.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn quote(
    item: &Item,
    quantity: i64,
    vip: Option<&VipTier>,
    currency: &str,
    exchange_rate: f64,
) -> PriceSnapshot {
    let base_price = item.price_in(currency);
    let inflation_multiplier = (1.0 + item.inflation_rate).powf(item.total_sold as f64);
    let vip_discount = vip
        .filter(|tier| tier.applies_to(item))
        .map_or(0.0, |tier| tier.discount_pct);

    let raw_unit =
        base_price as f64 * inflation_multiplier * (1.0 - vip_discount) * exchange_rate;
    let unit_price = raw_unit.floor().max(0.0) as i64;
    let quantity = quantity.max(1);

    PriceSnapshot {
        item_id: item.id.clone(),
        currency: currency.to_string(),
        base_price,
        inflation_multiplier,
        vip_discount,
        exchange_rate,
        unit_price,
        final_price: unit_price * quantity,
        computed_at: Utc::now(),
    }
}
