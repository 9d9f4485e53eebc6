//! LookupLimitsHandler - usage and limits of an org's current features.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::application::handlers::catalog::{decode_price, is_catalog_price};
use crate::application::handlers::org::OrgDirectory;
use crate::application::handlers::schedule::current_subscription;
use crate::domain::errors::ControlError;
use crate::domain::foundation::OrgId;
use crate::domain::usage::Usage;
use crate::ports::{LedgerClient, SubscriptionItem};

pub struct LookupLimitsHandler {
    ledger: Arc<dyn LedgerClient>,
    orgs: OrgDirectory,
}

impl LookupLimitsHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>, orgs: OrgDirectory) -> Self {
        Self { ledger, orgs }
    }

    /// One `Usage` per catalog feature of the current subscription, sorted
    /// by feature. Licensed features report zero use.
    pub async fn handle(&self, org: &OrgId) -> Result<Vec<Usage>, ControlError> {
        let customer_id = self.orgs.resolve(org).await?;
        let Some(subscription) = current_subscription(self.ledger.as_ref(), &customer_id)
            .await
            .map_err(|e| self.orgs.normalize(org, "list_subscriptions", e))?
        else {
            return Ok(Vec::new());
        };

        let items = subscription
            .items
            .iter()
            .filter(|item| is_catalog_price(&item.price))
            .map(|item| self.usage(org, item));
        let mut usage: Vec<Usage> = try_join_all(items).await?.into_iter().flatten().collect();
        usage.sort_by(|a, b| a.feature.cmp(&b.feature));
        Ok(usage)
    }

    async fn usage(&self, org: &OrgId, item: &SubscriptionItem) -> Result<Option<Usage>, ControlError> {
        let entry = match decode_price(&item.price) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(org = %org, price = %item.price.id, error = %err, "Skipping undecodable price");
                return Ok(None);
            }
        };
        let used = if entry.is_metered() {
            self.ledger
                .usage_total(&item.id)
                .await
                .map_err(|e| e.into_control("usage_total", org))?
        } else {
            0
        };
        Ok(Some(Usage {
            limit: entry.limit(),
            feature: entry.feature_plan,
            used,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stripe::InMemoryLedger;
    use crate::application::handlers::catalog::PushCatalogHandler;
    use crate::application::handlers::schedule::{ScheduleOrgCommand, ScheduleOrgHandler};
    use crate::domain::catalog::{Aggregate, CatalogEntry, Tier, INF};
    use crate::domain::foundation::{Effective, FeaturePlan};
    use crate::domain::schedule::Phase;
    use crate::domain::usage::UsageAction;
    use crate::ports::UsageRecordRequest;

    fn fp(name: &str) -> FeaturePlan {
        FeaturePlan::parse(&format!("feature:{}@plan:p@0", name)).unwrap()
    }

    #[tokio::test]
    async fn reports_usage_and_limits() {
        let ledger = InMemoryLedger::new();
        let shared: Arc<dyn LedgerClient> = Arc::new(ledger.clone());
        let org = OrgId::parse("org:acme").unwrap();

        let mut api = CatalogEntry::new(fp("api"));
        api.aggregate = Some(Aggregate::Sum);
        api.tiers = vec![
            Tier { upto: 100, price: 0.0, base: 0 },
            Tier { upto: 1000, price: 0.5, base: 0 },
        ];
        let mut storage = CatalogEntry::new(fp("storage"));
        storage.aggregate = Some(Aggregate::Max);
        storage.tiers = vec![Tier { upto: INF, price: 1.0, base: 0 }];
        PushCatalogHandler::new(Arc::clone(&shared), 5, 10)
            .handle(vec![api, storage, CatalogEntry::new(fp("seats"))], |_| {})
            .await;

        let orgs = OrgDirectory::new(Arc::clone(&shared), 10);
        ScheduleOrgHandler::new(Arc::clone(&shared), orgs.clone())
            .handle(ScheduleOrgCommand::new(
                org.clone(),
                vec![Phase::immediate(vec![fp("api"), fp("seats"), fp("storage")])],
            ))
            .await
            .unwrap();

        let customer = orgs.resolve(&org).await.unwrap();
        let sub = ledger.subscriptions_of(&customer).remove(0);
        let api_item = sub
            .items
            .iter()
            .find(|i| i.price.lookup_key.as_deref() == Some("feature:api@plan:p@0"))
            .unwrap();
        ledger
            .create_usage_record(UsageRecordRequest {
                subscription_item_id: api_item.id.clone(),
                quantity: 42,
                timestamp: Effective::Immediate,
                action: UsageAction::Increment,
                idempotency_key: "k1".to_string(),
            })
            .await
            .unwrap();

        let usage = LookupLimitsHandler::new(shared, orgs).handle(&org).await.unwrap();
        let summary: Vec<(String, i64, i64)> = usage
            .iter()
            .map(|u| (u.feature.feature().short().to_string(), u.used, u.limit))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("api".to_string(), 42, 1000),
                ("seats".to_string(), 0, INF),
                ("storage".to_string(), 0, INF),
            ]
        );
    }

    #[tokio::test]
    async fn org_without_subscription_has_no_usage() {
        let ledger = InMemoryLedger::new();
        let shared: Arc<dyn LedgerClient> = Arc::new(ledger);
        let org = OrgId::parse("org:acme").unwrap();
        let orgs = OrgDirectory::new(Arc::clone(&shared), 10);
        orgs.ensure(&org, None).await.unwrap();
        let usage = LookupLimitsHandler::new(shared, orgs).handle(&org).await.unwrap();
        assert!(usage.is_empty());
    }
}
