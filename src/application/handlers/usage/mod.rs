//! Usage handlers.
//!
//! ## Commands
//! - Reporting metered usage, with retries under a deadline
//!
//! ## Queries
//! - Current-period usage and limits per feature

mod lookup_limits;
mod report_usage;

pub use lookup_limits::LookupLimitsHandler;
pub use report_usage::{ReportUsageCommand, ReportUsageHandler};
