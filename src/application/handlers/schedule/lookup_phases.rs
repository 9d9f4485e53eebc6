//! LookupPhasesHandler - rebuilds an org's phases from ledger state.

use std::collections::HashMap;
use std::sync::Arc;

use super::subscriptions::latest_subscription;
use crate::application::handlers::catalog::{plan_sizes, PullCatalogHandler, PullQuery};
use crate::application::handlers::org::OrgDirectory;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{FeaturePlan, OrgId, PlanId, Timestamp};
use crate::domain::schedule::{plans_and_fragments, OrgPhase};
use crate::ports::{
    EndBehavior, LedgerClient, LedgerSchedule, LedgerSubscription, SubscriptionStatus,
};

/// Maps ledger price ids back to catalog features.
struct PhaseBuilder<'a> {
    org: &'a OrgId,
    features_by_price: HashMap<String, FeaturePlan>,
    plan_sizes: HashMap<PlanId, usize>,
}

impl PhaseBuilder<'_> {
    fn features(&self, price_ids: &[String]) -> Vec<FeaturePlan> {
        let mut features: Vec<FeaturePlan> = price_ids
            .iter()
            .filter_map(|id| {
                let found = self.features_by_price.get(id).cloned();
                if found.is_none() {
                    tracing::debug!(org = %self.org, price = %id, "Ignoring price outside the catalog");
                }
                found
            })
            .collect();
        features.sort();
        features
    }

    fn phase(
        &self,
        effective: Timestamp,
        end: Option<Timestamp>,
        features: Vec<FeaturePlan>,
        trial: bool,
    ) -> OrgPhase {
        let (plans, fragments) = plans_and_fragments(&features, &self.plan_sizes);
        OrgPhase {
            org: self.org.clone(),
            effective,
            end,
            features,
            current: false,
            trial,
            plans,
            fragments,
        }
    }

    fn cancellation(&self, at: Timestamp) -> OrgPhase {
        self.phase(at, None, Vec::new(), false)
    }

    fn from_schedule(&self, schedule: &LedgerSchedule) -> Vec<OrgPhase> {
        let current_start = schedule.current_phase.map(|cp| cp.start);
        let mut phases: Vec<OrgPhase> = schedule
            .phases
            .iter()
            .map(|p| {
                let mut phase = self.phase(p.start, p.end, self.features(&p.prices), p.trial);
                phase.current = current_start == Some(p.start);
                phase
            })
            .collect();

        if schedule.end_behavior == EndBehavior::Cancel {
            if let Some(end) = phases.last().and_then(|p| p.end) {
                phases.push(self.cancellation(end));
            }
        }
        phases
    }

    fn from_subscription(&self, sub: &LedgerSubscription) -> Vec<OrgPhase> {
        let price_ids: Vec<String> = sub.items.iter().map(|i| i.price.id.clone()).collect();
        let features = self.features(&price_ids);
        let end = sub.cancel_at.or(sub.ended_at);

        let mut phases = Vec::new();
        let trial_index = match (sub.trial_start, sub.trial_end) {
            (Some(start), Some(trial_end)) => {
                phases.push(self.phase(start, Some(trial_end), features.clone(), true));
                phases.push(self.phase(trial_end, end, features, false));
                Some(0)
            }
            _ => {
                phases.push(self.phase(sub.start_date, end, features, false));
                None
            }
        };

        if !sub.status.is_ended() {
            let current = match (sub.status, trial_index) {
                (SubscriptionStatus::Trialing, Some(i)) => i,
                _ => phases.len() - 1,
            };
            phases[current].current = true;
        }
        if let Some(end) = end {
            phases.push(self.cancellation(end));
        }
        phases
    }
}

/// Handler for reading an org's phases.
pub struct LookupPhasesHandler {
    ledger: Arc<dyn LedgerClient>,
    orgs: OrgDirectory,
    catalog: PullCatalogHandler,
}

impl LookupPhasesHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>, orgs: OrgDirectory) -> Self {
        Self {
            catalog: PullCatalogHandler::new(Arc::clone(&ledger)),
            ledger,
            orgs,
        }
    }

    /// Every phase of the org's timeline, oldest first. An org without a
    /// subscription has none.
    pub async fn handle(&self, org: &OrgId) -> Result<Vec<OrgPhase>, ControlError> {
        // 1. Resolve the customer
        let customer_id = self.orgs.resolve(org).await?;

        // 2. Read the subscription and the catalog concurrently
        let subscription = async {
            latest_subscription(self.ledger.as_ref(), &customer_id)
                .await
                .map_err(|e| self.orgs.normalize(org, "list_subscriptions", e))
        };
        let query = PullQuery::all();
        let (subscription, entries) = tokio::try_join!(subscription, self.catalog.handle(&query))?;

        let Some(subscription) = subscription else {
            return Ok(Vec::new());
        };

        // 3. Map prices back to features
        let mut features_by_price: HashMap<String, FeaturePlan> = entries
            .iter()
            .filter_map(|e| Some((e.provider_id.clone()?, e.feature_plan.clone())))
            .collect();
        for item in &subscription.items {
            if let Some(fp) = item
                .price
                .lookup_key
                .as_deref()
                .and_then(|key| FeaturePlan::parse(key).ok())
            {
                features_by_price.entry(item.price.id.clone()).or_insert(fp);
            }
        }
        let builder = PhaseBuilder {
            org,
            features_by_price,
            plan_sizes: plan_sizes(&entries),
        };

        // 4. Rebuild from the schedule when one drives the subscription
        let phases = match &subscription.schedule {
            Some(schedule) if !subscription.status.is_ended() => builder.from_schedule(schedule),
            _ => builder.from_subscription(&subscription),
        };
        tracing::debug!(org = %org, phases = phases.len(), "Looked up phases");
        Ok(phases)
    }

    /// The phase in effect now, if any.
    pub async fn current(&self, org: &OrgId) -> Result<Option<OrgPhase>, ControlError> {
        Ok(self.handle(org).await?.into_iter().find(|p| p.current))
    }
}
