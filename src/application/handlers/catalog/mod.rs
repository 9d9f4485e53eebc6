//! Catalog handlers.
//!
//! ## Commands
//! - Publishing catalog entries as immutable ledger prices
//!
//! ## Queries
//! - Pulling the published catalog back
//! - Expanding plan references into their features

mod price_codec;
mod pull_catalog;
mod push_catalog;

pub use pull_catalog::{plan_sizes, PullCatalogHandler, PullQuery};
pub use push_catalog::{PushCatalogHandler, PushResult, PushStatus};

pub(crate) use price_codec::{decode as decode_price, is_catalog_price};
