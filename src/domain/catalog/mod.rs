//! Catalog domain module.
//!
//! Priced features grouped into versioned plans.
//!
//! # Module Structure
//!
//! - `feature` - CatalogEntry, tiers and pricing enums
//! - `model` - declarative pricing document
//! - `validation` - local checks run before publishing

mod feature;
mod model;
mod validation;

pub use feature::{
    decimal_places, format_decimal, format_limit, parse_limit, Aggregate, CatalogEntry, Divide,
    Interval, Rounding, Tier, TierMode, INF,
};
pub use model::{FeatureDef, PlanDef, PricingModel, TierDef};
pub use validation::{validate_entries, validate_entry, MAX_PRICE_DECIMALS};
