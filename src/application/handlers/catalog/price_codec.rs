//! Catalog entry <-> ledger price mapping.
//!
//! A published entry is one ledger price:
//! - lookup key: the FeaturePlan text (`feature:x@plan:p@v`)
//! - metadata: plan, plan title, feature, title and limit under `entitle.*`
//! - an unbounded tier has no `up_to`; the limit is stored as `inf`

use std::collections::HashMap;

use crate::domain::catalog::{format_decimal, format_limit, CatalogEntry, Tier, INF};
use crate::domain::foundation::{FeaturePlan, ValidationError};
use crate::domain::metadata;
use crate::ports::{CreatePriceRequest, LedgerPrice, PriceTier};

/// Builds the create request for `entry`.
pub fn encode(entry: &CatalogEntry) -> CreatePriceRequest {
    let mut meta = HashMap::new();
    meta.insert(metadata::PLAN.to_string(), entry.plan().to_string());
    meta.insert(metadata::PLAN_TITLE.to_string(), entry.plan_title.clone());
    meta.insert(metadata::FEATURE.to_string(), entry.name().short().to_string());
    meta.insert(metadata::TITLE.to_string(), entry.title.clone());
    meta.insert(metadata::LIMIT.to_string(), format_limit(entry.limit()));

    let tiers: Vec<PriceTier> = entry
        .tiers
        .iter()
        .map(|tier| PriceTier {
            up_to: (!tier.is_unbounded()).then_some(tier.upto),
            unit_amount_decimal: Some(format_decimal(tier.price)),
            flat_amount: Some(tier.base),
        })
        .collect();

    CreatePriceRequest {
        lookup_key: entry.feature_plan.to_string(),
        currency: entry.currency.clone(),
        product_name: entry.title.clone(),
        interval: entry.interval,
        metered: entry.is_metered(),
        aggregate: entry.aggregate,
        unit_amount_decimal: tiers.is_empty().then(|| entry.base.to_string()),
        tiers_mode: (!tiers.is_empty()).then_some(entry.mode),
        tiers,
        transform: entry.divide,
        metadata: meta,
    }
}

/// Whether `price` was published by the engine.
pub fn is_catalog_price(price: &LedgerPrice) -> bool {
    price.metadata.contains_key(metadata::FEATURE)
}

/// Rebuilds the entry a price was published from.
pub fn decode(price: &LedgerPrice) -> Result<CatalogEntry, ValidationError> {
    let lookup_key = price
        .lookup_key
        .as_deref()
        .ok_or_else(|| ValidationError::empty_field(format!("{}: lookup_key", price.id)))?;
    let feature_plan = FeaturePlan::parse(lookup_key)?;

    let mut entry = CatalogEntry::new(feature_plan);
    if let Some(title) = price.metadata.get(metadata::PLAN_TITLE) {
        entry.plan_title = title.clone();
    }
    if let Some(title) = price.metadata.get(metadata::TITLE) {
        entry.title = title.clone();
    }
    entry.currency = price.currency.clone();
    entry.interval = price.interval.unwrap_or_default();
    entry.aggregate = if price.metered { price.aggregate } else { None };
    entry.mode = price.tiers_mode.unwrap_or_default();
    entry.divide = price.transform;
    entry.provider_id = Some(price.id.clone());

    if price.tiers.is_empty() {
        if let Some(amount) = &price.unit_amount_decimal {
            entry.base = parse_amount(&price.id, amount)?;
        }
    } else {
        entry.tiers = price
            .tiers
            .iter()
            .map(|tier| decode_tier(&price.id, tier))
            .collect::<Result<_, _>>()?;
    }
    Ok(entry)
}

fn decode_tier(price_id: &str, tier: &PriceTier) -> Result<Tier, ValidationError> {
    let price = match &tier.unit_amount_decimal {
        Some(amount) => amount.parse::<f64>().map_err(|_| {
            ValidationError::invalid_format(format!("{}: tiers.unit_amount_decimal", price_id), amount.clone())
        })?,
        None => 0.0,
    };
    Ok(Tier {
        upto: tier.up_to.unwrap_or(INF),
        price,
        base: tier.flat_amount.unwrap_or(0),
    })
}

/// Whole minor units; the ledger may render them as `"500"` or `"500.0"`.
fn parse_amount(price_id: &str, amount: &str) -> Result<i64, ValidationError> {
    if let Ok(whole) = amount.parse::<i64>() {
        return Ok(whole);
    }
    let field = format!("{}: unit_amount_decimal", price_id);
    let value = amount
        .parse::<f64>()
        .map_err(|_| ValidationError::invalid_format(field.clone(), amount.to_string()))?;
    if value.fract() != 0.0 {
        return Err(ValidationError::invalid_format(field, "base must be whole minor units"));
    }
    Ok(value as i64)
}
