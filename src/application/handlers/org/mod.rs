//! Org handlers.
//!
//! Maps engine org ids to ledger customers:
//! - Resolving an org to its customer id (cached)
//! - Creating the customer on first use, idempotently
//! - Reading back profile data

mod org_directory;

pub use org_directory::OrgDirectory;
