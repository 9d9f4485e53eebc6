//! Schedule domain module.
//!
//! - `phase` - desired `Phase`, reconstructed `OrgPhase`, plan/fragment split
//! - `validation` - phase list checks

mod phase;
mod validation;

pub use phase::{is_cancel_now, plans_and_fragments, OrgPhase, Phase, MAX_PHASE_ITEMS};
pub use validation::validate_phases;
