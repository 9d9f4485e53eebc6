//! PullCatalogHandler - reads the published catalog back from the ledger.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::price_codec;
use crate::domain::catalog::CatalogEntry;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{FeaturePlan, PlanId};
use crate::ports::{list_all, LedgerClient, LedgerPrice, PriceQuery};

/// Query for pulling the catalog.
#[derive(Debug, Clone, Default)]
pub struct PullQuery {
    /// Plans to keep; empty keeps every plan.
    pub plans: Vec<PlanId>,
}

impl PullQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn plans(plans: impl IntoIterator<Item = PlanId>) -> Self {
        Self {
            plans: plans.into_iter().collect(),
        }
    }

    fn keeps(&self, plan: &PlanId) -> bool {
        self.plans.is_empty() || self.plans.contains(plan)
    }
}

pub struct PullCatalogHandler {
    ledger: Arc<dyn LedgerClient>,
}

impl PullCatalogHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    /// Every published entry matching `query`, sorted by (plan, feature).
    ///
    /// Prices the engine did not publish are ignored; published prices that
    /// no longer decode are skipped with a warning.
    pub async fn handle(&self, query: &PullQuery) -> Result<Vec<CatalogEntry>, ControlError> {
        let prices = self.all_prices().await?;
        let mut entries: Vec<CatalogEntry> = prices
            .iter()
            .filter(|price| price_codec::is_catalog_price(price))
            .filter_map(|price| match price_codec::decode(price) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(price = %price.id, error = %err, "Skipping undecodable catalog price");
                    None
                }
            })
            .filter(|entry| query.keeps(entry.plan()))
            .collect();
        entries.sort_by(|a, b| a.feature_plan.cmp(&b.feature_plan));
        tracing::debug!(count = entries.len(), "Pulled catalog");
        Ok(entries)
    }

    /// Resolves whole-plan references to their published features.
    pub async fn expand_plans(&self, plans: &[PlanId]) -> Result<Vec<FeaturePlan>, ControlError> {
        let entries = self.handle(&PullQuery::plans(plans.iter().cloned())).await?;
        let published: BTreeSet<&PlanId> = entries.iter().map(|e| e.plan()).collect();
        if let Some(missing) = plans.iter().find(|p| !published.contains(p)) {
            return Err(ControlError::feature_not_found(missing));
        }
        Ok(entries.into_iter().map(|e| e.feature_plan).collect())
    }

    async fn all_prices(&self) -> Result<Vec<LedgerPrice>, ControlError> {
        list_all(|page| self.ledger.list_prices(PriceQuery::default(), page))
            .await
            .map_err(|e| e.into_control("list_prices", "catalog"))
    }
}

/// Number of published features per plan.
pub fn plan_sizes(entries: &[CatalogEntry]) -> HashMap<PlanId, usize> {
    let mut sizes = HashMap::new();
    for entry in entries {
        *sizes.entry(entry.plan().clone()).or_insert(0) += 1;
    }
    sizes
}
