//! Entitle - entitlement and usage-pricing reconciliation
//!
//! Declares per-org feature entitlements and usage pricing, and reconciles
//! them against a Stripe-style billing ledger: a versioned feature catalog
//! published as prices, per-org phase schedules, metered usage reporting and
//! the read paths that recombine catalog and schedule state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use entitle::adapters::StripeLedgerAdapter;
//! use entitle::application::Control;
//! use entitle::config::{init_tracing, AppConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! init_tracing(&config.telemetry);
//!
//! let ledger = Arc::new(StripeLedgerAdapter::new(config.ledger.to_stripe_config()));
//! let control = Control::new(ledger, config.engine.clone());
//! let catalog = control.pull(&Default::default()).await?;
//! println!("{} published features", catalog.len());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::Control;
pub use domain::errors::ControlError;
