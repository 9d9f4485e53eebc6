//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the engine to external systems:
//! - `stripe` - Ledger implementations (Stripe REST API, in-memory)

pub mod stripe;

pub use stripe::{InMemoryLedger, StripeConfig, StripeLedgerAdapter};
