//! Application handlers.
//!
//! Command and query handlers that reconcile engine state with the ledger.

pub mod catalog;
pub mod clock;
pub mod org;
pub mod schedule;
pub mod usage;

pub use catalog::{PullCatalogHandler, PullQuery, PushCatalogHandler, PushResult, PushStatus};
pub use clock::SimulatedClockHandler;
pub use org::OrgDirectory;
pub use schedule::{
    FeatureResolver, LookupPhasesHandler, ScheduleOrgCommand, ScheduleOrgHandler, ScheduleOutcome,
};
pub use usage::{LookupLimitsHandler, ReportUsageCommand, ReportUsageHandler};
