//! Metered usage value types.

use serde::{Deserialize, Serialize};

use super::catalog::{format_limit, INF};
use crate::domain::foundation::FeaturePlan;

/// How a usage report combines with what was recorded before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    /// Adds to the quantity already recorded.
    #[default]
    Increment,
    /// Replaces the quantity recorded at the same timestamp.
    Set,
}

impl UsageAction {
    pub fn from_clobber(clobber: bool) -> Self {
        if clobber {
            UsageAction::Set
        } else {
            UsageAction::Increment
        }
    }

    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            UsageAction::Increment => "increment",
            UsageAction::Set => "set",
        }
    }
}

/// Current consumption of one feature against its limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub feature: FeaturePlan,
    pub used: i64,
    pub limit: i64,
}

impl Usage {
    pub fn is_unlimited(&self) -> bool {
        self.limit == INF
    }

    /// Units left before the limit; `None` when unlimited.
    pub fn remaining(&self) -> Option<i64> {
        (!self.is_unlimited()).then(|| (self.limit - self.used).max(0))
    }
}

impl std::fmt::Display for Usage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.feature, self.used, format_limit(self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(used: i64, limit: i64) -> Usage {
        Usage {
            feature: FeaturePlan::parse("feature:t@plan:test@0").unwrap(),
            used,
            limit,
        }
    }

    #[test]
    fn remaining_is_clamped_at_zero() {
        assert_eq!(usage(3, 10).remaining(), Some(7));
        assert_eq!(usage(12, 10).remaining(), Some(0));
        assert_eq!(usage(12, INF).remaining(), None);
    }

    #[test]
    fn display_spells_infinity() {
        assert_eq!(usage(10, INF).to_string(), "feature:t@plan:test@0 10/inf");
    }

    #[test]
    fn clobber_maps_to_set() {
        assert_eq!(UsageAction::from_clobber(true), UsageAction::Set);
        assert_eq!(UsageAction::from_clobber(false).as_ledger_str(), "increment");
    }
}
