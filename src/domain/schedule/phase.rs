//! Desired and reconstructed phases of an org's entitlement timeline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::foundation::{Effective, FeaturePlan, OrgId, PlanId, Timestamp};

/// Most items a single ledger schedule phase may carry.
pub const MAX_PHASE_ITEMS: usize = 20;

/// A period the caller wants an org to be entitled to a set of features.
///
/// A phase without features is a cancellation and may only end a list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub effective: Effective,
    #[serde(default)]
    pub features: Vec<FeaturePlan>,
    #[serde(default)]
    pub trial: bool,
}

impl Phase {
    pub fn new(effective: Effective, features: Vec<FeaturePlan>) -> Self {
        Self {
            effective,
            features,
            trial: false,
        }
    }

    /// Starts as soon as the ledger processes the request.
    pub fn immediate(features: Vec<FeaturePlan>) -> Self {
        Self::new(Effective::Immediate, features)
    }

    pub fn at(ts: Timestamp, features: Vec<FeaturePlan>) -> Self {
        Self::new(Effective::At(ts), features)
    }

    pub fn with_trial(mut self, trial: bool) -> Self {
        self.trial = trial;
        self
    }

    pub fn cancel_now() -> Self {
        Self::new(Effective::Immediate, Vec::new())
    }

    pub fn cancel_at(ts: Timestamp) -> Self {
        Self::new(Effective::At(ts), Vec::new())
    }

    pub fn is_cancel(&self) -> bool {
        self.features.is_empty()
    }
}

/// Whether `phases` asks to cancel the subscription right away.
pub fn is_cancel_now(phases: &[Phase]) -> bool {
    matches!(phases, [only] if only.is_cancel() && only.effective.is_immediate())
}

/// A phase rebuilt from ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgPhase {
    pub org: OrgId,
    pub effective: Timestamp,
    pub end: Option<Timestamp>,
    pub features: Vec<FeaturePlan>,
    pub current: bool,
    pub trial: bool,
    /// Plans whose every published feature is present.
    pub plans: Vec<PlanId>,
    /// Features present without all of their plan siblings.
    pub fragments: Vec<FeaturePlan>,
}

impl OrgPhase {
    pub fn is_cancel(&self) -> bool {
        self.features.is_empty()
    }

    /// Converts back into a desired phase, keeping the concrete start.
    pub fn to_phase(&self) -> Phase {
        Phase::at(self.effective, self.features.clone()).with_trial(self.trial)
    }
}

/// Splits `features` into whole plans and fragments.
///
/// A plan is whole when the phase holds as many of its features as the
/// catalog publishes for it. Features of plans missing from `plan_sizes`
/// are always fragments.
pub fn plans_and_fragments(
    features: &[FeaturePlan],
    plan_sizes: &HashMap<PlanId, usize>,
) -> (Vec<PlanId>, Vec<FeaturePlan>) {
    let mut by_plan: BTreeMap<&PlanId, BTreeSet<&FeaturePlan>> = BTreeMap::new();
    for fp in features {
        by_plan.entry(fp.plan()).or_default().insert(fp);
    }

    let mut plans = Vec::new();
    let mut fragments = Vec::new();
    for (plan, present) in by_plan {
        if plan_sizes.get(plan) == Some(&present.len()) {
            plans.push(plan.clone());
        } else {
            fragments.extend(present.into_iter().cloned());
        }
    }
    (plans, fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> FeaturePlan {
        FeaturePlan::parse(s).unwrap()
    }

    fn sizes(pairs: &[(&str, usize)]) -> HashMap<PlanId, usize> {
        pairs
            .iter()
            .map(|(p, n)| (PlanId::parse(p).unwrap(), *n))
            .collect()
    }

    // ════════════════════════════════════════════════════════════════════
    // Phase constructors
    // ════════════════════════════════════════════════════════════════════

    #[test]
    fn cancel_phases_have_no_features() {
        assert!(Phase::cancel_now().is_cancel());
        assert!(Phase::cancel_at(Timestamp::from_unix(10).unwrap()).is_cancel());
        assert!(!Phase::immediate(vec![fp("feature:a@plan:p@0")]).is_cancel());
    }

    #[test]
    fn cancel_now_needs_a_single_immediate_empty_phase() {
        assert!(is_cancel_now(&[Phase::cancel_now()]));
        assert!(!is_cancel_now(&[Phase::cancel_at(Timestamp::from_unix(10).unwrap())]));
        assert!(!is_cancel_now(&[]));
        assert!(!is_cancel_now(&[
            Phase::immediate(vec![fp("feature:a@plan:p@0")]),
            Phase::cancel_now(),
        ]));
    }

    // ════════════════════════════════════════════════════════════════════
    // Plans and fragments
    // ════════════════════════════════════════════════════════════════════

    #[test]
    fn partial_plan_yields_fragments() {
        let (plans, fragments) =
            plans_and_fragments(&[fp("feature:a@plan:p@0")], &sizes(&[("plan:p@0", 2)]));
        assert!(plans.is_empty());
        assert_eq!(fragments, vec![fp("feature:a@plan:p@0")]);
    }

    #[test]
    fn whole_plan_yields_plan() {
        let (plans, fragments) = plans_and_fragments(
            &[fp("feature:b@plan:p@0"), fp("feature:a@plan:p@0")],
            &sizes(&[("plan:p@0", 2)]),
        );
        assert_eq!(plans, vec![PlanId::parse("plan:p@0").unwrap()]);
        assert!(fragments.is_empty());
    }

    #[test]
    fn unknown_plan_features_are_fragments() {
        let (plans, fragments) =
            plans_and_fragments(&[fp("feature:a@plan:gone@1")], &HashMap::new());
        assert!(plans.is_empty());
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn mixed_phase_splits_per_plan() {
        let features = vec![
            fp("feature:a@plan:p@0"),
            fp("feature:b@plan:p@0"),
            fp("feature:x@plan:q@1"),
        ];
        let (plans, fragments) =
            plans_and_fragments(&features, &sizes(&[("plan:p@0", 2), ("plan:q@1", 3)]));
        assert_eq!(plans, vec![PlanId::parse("plan:p@0").unwrap()]);
        assert_eq!(fragments, vec![fp("feature:x@plan:q@1")]);
    }
}
