//! Schedule handlers.
//!
//! ## Commands
//! - Reconciling an org's subscription schedule with desired phases
//!
//! ## Queries
//! - Rebuilding an org's phases (and the current one) from ledger state

mod feature_resolver;
mod lookup_phases;
mod schedule_org;
mod subscriptions;

pub use feature_resolver::FeatureResolver;
pub use lookup_phases::LookupPhasesHandler;
pub use schedule_org::{ScheduleOrgCommand, ScheduleOrgHandler, ScheduleOutcome};

pub(crate) use subscriptions::current_subscription;
