//! Foundation module - Shared domain primitives.
//!
//! Identifiers, time values and validation errors that form the vocabulary
//! of the entitlement domain.

mod errors;
mod ids;
mod timestamp;

pub use errors::ValidationError;
pub use ids::{ClockId, FeatureName, FeaturePlan, OrgId, PlanId};
pub use timestamp::{Effective, Timestamp};
