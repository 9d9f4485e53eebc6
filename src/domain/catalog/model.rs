//! Declarative pricing model.
//!
//! The JSON document callers hand to the publisher:
//!
//! ```json
//! {
//!   "plans": {
//!     "plan:pro@1": {
//!       "title": "Pro",
//!       "currency": "usd",
//!       "interval": "@monthly",
//!       "features": {
//!         "feature:seats": { "base": 1000 },
//!         "feature:tokens": {
//!           "aggregate": "sum",
//!           "tiers": [{ "upto": 1000 }, { "price": 0.01 }]
//!         }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! A tier with a zero or omitted `upto` is unbounded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::feature::{Aggregate, CatalogEntry, Divide, Interval, Tier, TierMode, INF};
use crate::domain::foundation::{FeatureName, PlanId, ValidationError};

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingModel {
    #[serde(default)]
    pub plans: BTreeMap<PlanId, PlanDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDef {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default)]
    pub features: BTreeMap<FeatureName, FeatureDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDef {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub base: i64,
    #[serde(default)]
    pub mode: TierMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<TierDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divide: Option<Divide>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upto: Option<i64>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub base: i64,
}

impl TierDef {
    fn to_tier(self) -> Tier {
        let upto = match self.upto {
            None | Some(0) => INF,
            Some(n) => n,
        };
        Tier {
            upto,
            price: self.price,
            base: self.base,
        }
    }

    fn from_tier(tier: &Tier) -> Self {
        Self {
            upto: (tier.upto != INF).then_some(tier.upto),
            price: tier.price,
            base: tier.base,
        }
    }
}

impl PricingModel {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::invalid_format("pricing model", e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ValidationError::invalid_format("pricing model", e.to_string()))
    }

    /// Flattens the model into catalog entries ordered by plan, then feature.
    pub fn to_entries(&self) -> Vec<CatalogEntry> {
        let mut entries = Vec::new();
        for (plan_id, plan) in &self.plans {
            let plan_title = if plan.title.is_empty() {
                plan_id.to_string()
            } else {
                plan.title.clone()
            };
            for (name, def) in &plan.features {
                let title = if def.title.is_empty() {
                    name.to_string()
                } else {
                    def.title.clone()
                };
                entries.push(CatalogEntry {
                    feature_plan: name.with_plan(plan_id),
                    plan_title: plan_title.clone(),
                    title,
                    currency: plan.currency.to_ascii_lowercase(),
                    interval: plan.interval,
                    base: def.base,
                    mode: def.mode,
                    aggregate: def.aggregate,
                    tiers: def.tiers.iter().map(|t| t.to_tier()).collect(),
                    divide: def.divide,
                    provider_id: None,
                });
            }
        }
        entries.sort_by(|a, b| a.feature_plan.cmp(&b.feature_plan));
        entries
    }

    /// Rebuilds a model from entries, e.g. the output of a catalog pull.
    ///
    /// Plan-level fields are taken from the first entry seen for each plan.
    pub fn from_entries(entries: &[CatalogEntry]) -> Self {
        let mut plans: BTreeMap<PlanId, PlanDef> = BTreeMap::new();
        for entry in entries {
            let plan = plans.entry(entry.plan().clone()).or_insert_with(|| PlanDef {
                title: entry.plan_title.clone(),
                currency: entry.currency.clone(),
                interval: entry.interval,
                features: BTreeMap::new(),
            });
            plan.features.insert(
                entry.name().clone(),
                FeatureDef {
                    title: entry.title.clone(),
                    base: entry.base,
                    mode: entry.mode,
                    aggregate: entry.aggregate,
                    tiers: entry.tiers.iter().map(TierDef::from_tier).collect(),
                    divide: entry.divide,
                },
            );
        }
        Self { plans }
    }
}
