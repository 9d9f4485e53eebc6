//! Stripe ledger adapters.
//!
//! Implements the `LedgerClient` port twice:
//! - `StripeLedgerAdapter` talks to the Stripe REST API
//! - `InMemoryLedger` keeps the same semantics in memory for tests and
//!   local runs, with error injection and simulated races
//!
//! # Security
//!
//! - API keys are handled via `secrecy::SecretString` and never logged
//!
//! # Configuration
//!
//! Read by `config::LedgerConfig`:
//! - `ENTITLE__LEDGER__API_KEY`: Stripe secret or restricted key
//! - `ENTITLE__LEDGER__ACCOUNT`: optional connected account

mod in_memory_ledger;
mod stripe_adapter;
mod wire_types;

pub use in_memory_ledger::{InMemoryLedger, MethodCall};
pub use stripe_adapter::{StripeConfig, StripeLedgerAdapter};
pub use wire_types::{Expandable, StripeErrorBody, StripeErrorDetail};
