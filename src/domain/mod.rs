//! Domain layer: value types and pure rules, no I/O.
//!
//! # Module Organization
//!
//! - `foundation` - identifiers, timestamps, validation errors
//! - `catalog` - priced features, tiers, declarative pricing model
//! - `schedule` - desired and reconstructed phases
//! - `usage` - usage actions and limits
//! - `org` - org profile carried on the ledger customer
//! - `errors` - engine error taxonomy

pub mod catalog;
pub mod errors;
pub mod foundation;
pub mod org;
pub mod schedule;
pub mod usage;

/// Metadata keys the engine writes on ledger objects. Callers may not use
/// the prefix themselves.
pub mod metadata {
    pub const PREFIX: &str = "entitle.";
    pub const ORG: &str = "entitle.org";
    pub const PLAN: &str = "entitle.plan";
    pub const PLAN_TITLE: &str = "entitle.plan_title";
    pub const FEATURE: &str = "entitle.feature";
    pub const TITLE: &str = "entitle.title";
    pub const LIMIT: &str = "entitle.limit";

    pub fn is_reserved(key: &str) -> bool {
        key.starts_with(PREFIX)
    }
}
