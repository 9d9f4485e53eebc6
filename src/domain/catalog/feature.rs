//! Catalog entries: one immutable priced feature within a plan.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::foundation::{FeatureName, FeaturePlan, PlanId};

/// Sentinel for an unbounded tier or limit.
pub const INF: i64 = i64::MAX;

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "@daily")]
    Day,
    #[serde(rename = "@weekly")]
    Week,
    #[default]
    #[serde(rename = "@monthly")]
    Month,
    #[serde(rename = "@yearly")]
    Year,
}

impl Interval {
    /// Ledger spelling (`recurring[interval]`).
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Year => "year",
        }
    }

    pub fn from_ledger_str(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Interval::Day),
            "week" => Some(Interval::Week),
            "month" => Some(Interval::Month),
            "year" => Some(Interval::Year),
            _ => None,
        }
    }
}

/// How tiers are applied to a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    /// Each unit is priced by the tier it falls into.
    #[default]
    Graduated,
    /// All units are priced by the tier the total falls into.
    Volume,
}

impl TierMode {
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            TierMode::Graduated => "graduated",
            TierMode::Volume => "volume",
        }
    }

    pub fn from_ledger_str(s: &str) -> Option<Self> {
        match s {
            "graduated" => Some(TierMode::Graduated),
            "volume" => Some(TierMode::Volume),
            _ => None,
        }
    }
}

/// How metered usage within a period is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Sum,
    Max,
    /// Last value reported during the period.
    Last,
    /// Last value ever reported, carried across periods.
    Perpetual,
}

impl Aggregate {
    /// Ledger spelling (`recurring[aggregate_usage]`).
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Max => "max",
            Aggregate::Last => "last_during_period",
            Aggregate::Perpetual => "last_ever",
        }
    }

    pub fn from_ledger_str(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(Aggregate::Sum),
            "max" => Some(Aggregate::Max),
            "last_during_period" => Some(Aggregate::Last),
            "last_ever" => Some(Aggregate::Perpetual),
            _ => None,
        }
    }
}

/// Rounding applied after dividing a reported quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    #[default]
    Up,
    Down,
}

impl Rounding {
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            Rounding::Up => "up",
            Rounding::Down => "down",
        }
    }

    pub fn from_ledger_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Rounding::Up),
            "down" => Some(Rounding::Down),
            _ => None,
        }
    }
}

/// Quantity transform: billed quantity = reported / `by`, rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Divide {
    pub by: i64,
    #[serde(default)]
    pub rounding: Rounding,
}

/// One pricing tier. Tiers are ordered ascending by `upto`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Inclusive upper bound; [`INF`] for unbounded.
    pub upto: i64,
    /// Unit price in minor currency units; may be fractional.
    ///
    /// Held as `f64`, so only about 15 significant digits survive. A price
    /// above 1e4 with 12 fractional digits loses its last digits before it
    /// is validated or sent, and the loss is not reported.
    pub price: f64,
    /// Flat amount charged once the tier is entered.
    pub base: i64,
}

impl Tier {
    pub fn is_unbounded(&self) -> bool {
        self.upto == INF
    }
}

/// A priced feature in a plan ("Feature").
///
/// Created once per [`FeaturePlan`] and never changed remotely. A new
/// version of a feature is published under a new plan version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub feature_plan: FeaturePlan,
    pub plan_title: String,
    pub title: String,
    pub currency: String,
    pub interval: Interval,
    pub base: i64,
    pub mode: TierMode,
    pub aggregate: Option<Aggregate>,
    pub tiers: Vec<Tier>,
    pub divide: Option<Divide>,
    /// Ledger price id; only set on entries read back from the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl CatalogEntry {
    /// A licensed, flat-priced entry with defaults for everything else.
    pub fn new(feature_plan: FeaturePlan) -> Self {
        let title = feature_plan.feature().to_string();
        let plan_title = feature_plan.plan().to_string();
        Self {
            feature_plan,
            plan_title,
            title,
            currency: "usd".to_string(),
            interval: Interval::default(),
            base: 0,
            mode: TierMode::default(),
            aggregate: None,
            tiers: Vec::new(),
            divide: None,
            provider_id: None,
        }
    }

    pub fn plan(&self) -> &PlanId {
        self.feature_plan.plan()
    }

    pub fn name(&self) -> &FeatureName {
        self.feature_plan.feature()
    }

    /// Usage-based entries carry an aggregation method.
    pub fn is_metered(&self) -> bool {
        self.aggregate.is_some()
    }

    /// Upper bound of the last tier, or [`INF`] without tiers.
    pub fn limit(&self) -> i64 {
        self.tiers.last().map(|t| t.upto).unwrap_or(INF)
    }

    /// Same entry with the ledger-assigned id dropped.
    pub fn without_provider_id(mut self) -> Self {
        self.provider_id = None;
        self
    }
}

impl fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.feature_plan)
    }
}

/// Renders a price the way the ledger's `*_decimal` fields expect.
///
/// This is the shortest text that parses back to the same `f64`, which is
/// what [`decimal_places`] and price validation see. It reflects the binary
/// value, not the literal the caller wrote.
pub fn format_decimal(price: f64) -> String {
    format!("{}", price)
}

/// Number of fractional digits in the shortest exact rendering of `price`.
pub fn decimal_places(price: f64) -> usize {
    let text = format_decimal(price);
    text.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0)
}

/// Renders an upper bound, using `inf` for [`INF`].
pub fn format_limit(limit: i64) -> String {
    if limit == INF {
        "inf".to_string()
    } else {
        limit.to_string()
    }
}

pub fn parse_limit(s: &str) -> Option<i64> {
    if s == "inf" {
        Some(INF)
    } else {
        s.parse().ok()
    }
}
