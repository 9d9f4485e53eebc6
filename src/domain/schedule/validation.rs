//! Shape checks for a desired phase list, run before any ledger call.

use std::collections::HashSet;

use super::phase::{Phase, MAX_PHASE_ITEMS};
use crate::domain::errors::ControlError;

pub fn validate_phases(phases: &[Phase]) -> Result<(), ControlError> {
    if phases.is_empty() {
        return Err(ControlError::invalid_phase("at least one phase is required"));
    }

    let last = phases.len() - 1;
    let mut prev_at = None;
    for (i, phase) in phases.iter().enumerate() {
        if phase.is_cancel() {
            if i != last {
                return Err(ControlError::invalid_phase(format!(
                    "phase {} has no features; only the final phase may cancel",
                    i
                )));
            }
            if phase.trial {
                return Err(ControlError::invalid_phase("a cancellation cannot be a trial"));
            }
        }

        if phase.features.len() > MAX_PHASE_ITEMS {
            return Err(ControlError::TooManyItems {
                count: phase.features.len(),
                max: MAX_PHASE_ITEMS,
            });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = phase.features.iter().find(|fp| !seen.insert(*fp)) {
            return Err(ControlError::invalid_phase(format!(
                "phase {} lists {} more than once",
                i, dup
            )));
        }

        match phase.effective.at() {
            None if i > 0 => {
                return Err(ControlError::invalid_phase(format!(
                    "phase {} starts immediately; only the first phase may",
                    i
                )));
            }
            None => {}
            Some(at) => {
                if let Some(prev) = prev_at {
                    if at <= prev {
                        return Err(ControlError::invalid_phase(format!(
                            "phase {} starts at {} which is not after {}",
                            i, at, prev
                        )));
                    }
                }
                prev_at = Some(at);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{FeaturePlan, Timestamp};

    fn fp(name: &str) -> FeaturePlan {
        FeaturePlan::parse(&format!("feature:{}@plan:p@0", name)).unwrap()
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix(secs).unwrap()
    }

    #[test]
    fn accepts_trailing_cancellation() {
        let phases = vec![Phase::immediate(vec![fp("a")]), Phase::cancel_at(ts(100))];
        assert!(validate_phases(&phases).is_ok());
    }

    #[test]
    fn rejects_cancellation_before_the_end() {
        let phases = vec![Phase::cancel_at(ts(50)), Phase::at(ts(100), vec![fp("a")])];
        assert!(matches!(validate_phases(&phases), Err(ControlError::InvalidPhase(_))));
    }

    #[test]
    fn rejects_empty_list() {
        assert!(validate_phases(&[]).is_err());
    }

    #[test]
    fn rejects_more_than_twenty_items() {
        let features = (0..21).map(|i| fp(&format!("f{}", i))).collect();
        let err = validate_phases(&[Phase::immediate(features)]).unwrap_err();
        assert!(matches!(err, ControlError::TooManyItems { count: 21, max: 20 }));

        let features = (0..20).map(|i| fp(&format!("f{}", i))).collect();
        assert!(validate_phases(&[Phase::immediate(features)]).is_ok());
    }

    #[test]
    fn rejects_late_immediate() {
        let phases = vec![Phase::at(ts(10), vec![fp("a")]), Phase::immediate(vec![fp("b")])];
        assert!(validate_phases(&phases).is_err());
    }

    #[test]
    fn rejects_non_increasing_starts() {
        let phases = vec![Phase::at(ts(10), vec![fp("a")]), Phase::at(ts(10), vec![fp("b")])];
        assert!(validate_phases(&phases).is_err());
    }

    #[test]
    fn rejects_duplicate_features() {
        let phases = vec![Phase::immediate(vec![fp("a"), fp("a")])];
        assert!(validate_phases(&phases).is_err());
    }

    #[test]
    fn rejects_trial_cancellation() {
        let phases = vec![Phase::cancel_now().with_trial(true)];
        assert!(validate_phases(&phases).is_err());
    }

    #[test]
    fn accepts_lone_cancel_now() {
        assert!(validate_phases(&[Phase::cancel_now()]).is_ok());
    }
}
