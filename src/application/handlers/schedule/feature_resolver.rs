//! Resolves feature plans to ledger price ids.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;

use crate::domain::errors::ControlError;
use crate::domain::foundation::FeaturePlan;
use crate::ports::{list_all, LedgerClient, LedgerError, PriceQuery, MAX_LOOKUP_KEYS};

#[derive(Clone)]
pub struct FeatureResolver {
    ledger: Arc<dyn LedgerClient>,
}

impl FeatureResolver {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    /// Price id of every feature in `features`.
    ///
    /// Lookup keys are queried in batches the ledger accepts. Fails with
    /// `FeatureNotFound`, naming every missing feature, when any is not
    /// published.
    pub async fn resolve(
        &self,
        features: &[FeaturePlan],
    ) -> Result<HashMap<FeaturePlan, String>, ControlError> {
        let wanted: BTreeSet<&FeaturePlan> = features.iter().collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = wanted.iter().map(|fp| fp.to_string()).collect();

        let batches = try_join_all(keys.chunks(MAX_LOOKUP_KEYS).map(|chunk| self.lookup(chunk)))
            .await
            .map_err(|e| e.into_control("list_prices", keys.join(", ")))?;

        let by_key: HashMap<String, String> = batches.into_iter().flatten().collect();
        let mut resolved = HashMap::with_capacity(wanted.len());
        let mut missing = Vec::new();
        for fp in wanted {
            match by_key.get(&fp.to_string()) {
                Some(price_id) => {
                    resolved.insert(fp.clone(), price_id.clone());
                }
                None => missing.push(fp.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(ControlError::feature_not_found(missing.join(", ")));
        }
        Ok(resolved)
    }

    /// (lookup key, price id) pairs for one batch of keys.
    async fn lookup(&self, keys: &[String]) -> Result<Vec<(String, String)>, LedgerError> {
        let query = PriceQuery {
            lookup_keys: keys.to_vec(),
        };
        let prices = list_all(|page| self.ledger.list_prices(query.clone(), page)).await?;
        Ok(prices
            .into_iter()
            .filter_map(|price| price.lookup_key.map(|key| (key, price.id)))
            .collect())
    }
}
