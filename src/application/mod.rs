//! Application layer - Commands, Queries, and Handlers.
//!
//! This layer orchestrates domain operations against the ledger port.
//! [`Control`] is the facade most callers need; the handlers stay public for
//! embedders that wire their own.

pub mod cancel;
pub mod control;
pub mod handlers;
pub mod keys;
pub mod loader;
pub mod retry;

pub use cancel::{CancelHandle, Cancellation};
pub use control::Control;
pub use handlers::{
    PullQuery, PushResult, PushStatus, ReportUsageCommand, ScheduleOrgCommand, ScheduleOutcome,
};
pub use loader::Loader;
pub use retry::Backoff;
