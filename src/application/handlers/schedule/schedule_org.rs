//! ScheduleOrgHandler - reconciles an org's subscription schedule with a
//! desired phase list.
//!
//! The ledger owns the timeline. Each call reads the org's current
//! subscription and rewrites its schedule so that, from the current phase
//! on, it matches the desired phases.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::feature_resolver::FeatureResolver;
use super::subscriptions::current_subscription;
use crate::application::handlers::org::OrgDirectory;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{Effective, FeaturePlan, OrgId};
use crate::domain::metadata;
use crate::domain::org::OrgInfo;
use crate::domain::schedule::{is_cancel_now, validate_phases, Phase, MAX_PHASE_ITEMS};
use crate::ports::{
    is_missing_customer, is_schedule_released, is_too_many_items, CreateScheduleRequest,
    EndBehavior, LedgerClient, LedgerError, LedgerSchedule, SchedulePhaseParams,
    UpdateScheduleRequest,
};

/// Command to set an org's entitlement timeline.
#[derive(Debug, Clone)]
pub struct ScheduleOrgCommand {
    pub org: OrgId,
    pub phases: Vec<Phase>,
    /// Customer details applied when the org is created or already exists.
    pub info: Option<OrgInfo>,
}

impl ScheduleOrgCommand {
    pub fn new(org: OrgId, phases: Vec<Phase>) -> Self {
        Self {
            org,
            phases,
            info: None,
        }
    }

    pub fn with_info(mut self, info: OrgInfo) -> Self {
        self.info = Some(info);
        self
    }
}

/// What the reconciler did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// Cancellation of an org without a subscription.
    Unchanged,
    Created { schedule_id: String },
    Updated { schedule_id: String },
    Canceled { subscription_id: String },
}

/// Desired phases in ledger terms.
#[derive(Debug, Clone)]
struct Desired {
    first: Effective,
    /// Every non-cancellation phase; each ends where the next one starts.
    phases: Vec<SchedulePhaseParams>,
    end_behavior: EndBehavior,
}

impl Desired {
    fn new(phases: &[Phase], prices: &HashMap<FeaturePlan, String>) -> Self {
        let params = phases
            .iter()
            .enumerate()
            .filter(|(_, phase)| !phase.is_cancel())
            .map(|(i, phase)| SchedulePhaseParams {
                start: None,
                end: phases.get(i + 1).map(|next| next.effective),
                prices: phase
                    .features
                    .iter()
                    .filter_map(|fp| prices.get(fp).cloned())
                    .collect(),
                trial: phase.trial,
            })
            .collect();
        let end_behavior = if phases.last().map_or(false, Phase::is_cancel) {
            EndBehavior::Cancel
        } else {
            EndBehavior::Release
        };
        Self {
            first: phases.first().map(|p| p.effective).unwrap_or_default(),
            phases: params,
            end_behavior,
        }
    }

    /// Phases for an update of `schedule`.
    ///
    /// An immediate first phase replaces the current phase and keeps its
    /// start. A dated first phase is preceded by the current phase, cut off
    /// where the new timeline begins.
    fn merge(&self, schedule: &LedgerSchedule) -> Vec<SchedulePhaseParams> {
        let current = schedule
            .current_phase
            .and_then(|cp| schedule.phases.iter().find(|p| p.start == cp.start));
        let mut merged = self.phases.clone();

        let first_start = match (self.first, current) {
            (Effective::At(at), Some(current)) if current.start < at => {
                merged.insert(
                    0,
                    SchedulePhaseParams {
                        start: None,
                        end: Some(Effective::At(at)),
                        prices: current.prices.clone(),
                        trial: current.trial,
                    },
                );
                Effective::At(current.start)
            }
            (_, Some(current)) => Effective::At(current.start),
            (first, None) => first,
        };
        if let Some(first) = merged.first_mut() {
            first.start = Some(first_start);
        }
        merged
    }
}

/// Handler for reconciling schedules.
pub struct ScheduleOrgHandler {
    ledger: Arc<dyn LedgerClient>,
    orgs: OrgDirectory,
    resolver: FeatureResolver,
}

impl ScheduleOrgHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>, orgs: OrgDirectory) -> Self {
        Self {
            resolver: FeatureResolver::new(Arc::clone(&ledger)),
            ledger,
            orgs,
        }
    }

    pub async fn handle(&self, cmd: ScheduleOrgCommand) -> Result<ScheduleOutcome, ControlError> {
        let org = &cmd.org;

        // 1. Validate the phase list
        validate_phases(&cmd.phases)?;

        // 2. Ensure the customer
        let customer_id = self.orgs.ensure(org, cmd.info.as_ref()).await?;

        // 3. Resolve every feature before changing anything
        let features: Vec<FeaturePlan> = cmd
            .phases
            .iter()
            .flat_map(|p| p.features.iter().cloned())
            .collect();
        let prices = self.resolver.resolve(&features).await?;
        let desired = Desired::new(&cmd.phases, &prices);

        // 4. Branch on the current subscription
        let subscription = current_subscription(self.ledger.as_ref(), &customer_id)
            .await
            .map_err(|e| self.normalize(org, "list_subscriptions", e, &[]))?;

        let Some(subscription) = subscription else {
            if desired.phases.is_empty() {
                tracing::debug!(org = %org, "No subscription to cancel");
                return Ok(ScheduleOutcome::Unchanged);
            }
            return self.create(org, &customer_id, desired).await;
        };

        if is_cancel_now(&cmd.phases) {
            return self.cancel(org, &subscription.id).await;
        }

        let schedule = match subscription.schedule.filter(|s| s.status.is_mutable()) {
            Some(schedule) => schedule,
            None => self.attach(org, &subscription.id).await?,
        };
        self.update(org, &subscription.id, schedule, &desired).await
    }

    async fn create(
        &self,
        org: &OrgId,
        customer_id: &str,
        desired: Desired,
    ) -> Result<ScheduleOutcome, ControlError> {
        let request = CreateScheduleRequest {
            customer_id: customer_id.to_string(),
            start: desired.first,
            phases: desired.phases,
            end_behavior: desired.end_behavior,
            metadata: HashMap::from([(metadata::ORG.to_string(), org.to_string())]),
        };
        let schedule = self
            .ledger
            .create_schedule(request.clone())
            .await
            .map_err(|e| self.normalize(org, "create_schedule", e, &request.phases))?;

        tracing::info!(
            org = %org,
            schedule = %schedule.id,
            phases = request.phases.len(),
            "Created subscription schedule"
        );
        Ok(ScheduleOutcome::Created {
            schedule_id: schedule.id,
        })
    }

    async fn cancel(&self, org: &OrgId, subscription_id: &str) -> Result<ScheduleOutcome, ControlError> {
        self.ledger
            .cancel_subscription(subscription_id, true, true)
            .await
            .map_err(|e| self.normalize(org, "cancel_subscription", e, &[]))?;
        tracing::info!(org = %org, subscription = %subscription_id, "Canceled subscription");
        Ok(ScheduleOutcome::Canceled {
            subscription_id: subscription_id.to_string(),
        })
    }

    /// Puts a schedule on a subscription that has none.
    async fn attach(&self, org: &OrgId, subscription_id: &str) -> Result<LedgerSchedule, ControlError> {
        let schedule = self
            .ledger
            .create_schedule_from_subscription(subscription_id)
            .await
            .map_err(|e| self.normalize(org, "create_schedule_from_subscription", e, &[]))?;
        tracing::debug!(org = %org, schedule = %schedule.id, "Attached schedule to subscription");
        Ok(schedule)
    }

    async fn update(
        &self,
        org: &OrgId,
        subscription_id: &str,
        schedule: LedgerSchedule,
        desired: &Desired,
    ) -> Result<ScheduleOutcome, ControlError> {
        let phases = desired.merge(&schedule);
        if phases.is_empty() {
            // Only a cancellation remains and nothing has started yet.
            return self.cancel(org, subscription_id).await;
        }

        match self.send_update(&schedule.id, phases, desired.end_behavior).await {
            Ok(id) => {
                tracing::info!(org = %org, schedule = %id, "Updated subscription schedule");
                Ok(ScheduleOutcome::Updated { schedule_id: id })
            }
            Err((err, _)) if is_schedule_released(&err) => {
                tracing::warn!(
                    org = %org,
                    schedule = %schedule.id,
                    "Schedule released during update; retrying on a new schedule"
                );
                let fresh = self.attach(org, subscription_id).await?;
                let phases = desired.merge(&fresh);
                let id = self
                    .send_update(&fresh.id, phases, desired.end_behavior)
                    .await
                    .map_err(|(err, phases)| self.normalize(org, "update_schedule", err, &phases))?;
                tracing::info!(org = %org, schedule = %id, "Updated subscription schedule");
                Ok(ScheduleOutcome::Updated { schedule_id: id })
            }
            Err((err, phases)) => Err(self.normalize(org, "update_schedule", err, &phases)),
        }
    }

    /// Returns the phases alongside a failure for error normalization.
    async fn send_update(
        &self,
        schedule_id: &str,
        phases: Vec<SchedulePhaseParams>,
        end_behavior: EndBehavior,
    ) -> Result<String, (LedgerError, Vec<SchedulePhaseParams>)> {
        let request = UpdateScheduleRequest {
            phases,
            end_behavior,
            prorate: true,
        };
        match self.ledger.update_schedule(schedule_id, request.clone()).await {
            Ok(schedule) => Ok(schedule.id),
            Err(err) => Err((err, request.phases)),
        }
    }

    fn normalize(
        &self,
        org: &OrgId,
        operation: &'static str,
        err: LedgerError,
        phases: &[SchedulePhaseParams],
    ) -> ControlError {
        if is_missing_customer(&err) {
            return self.orgs.missing(org);
        }
        if is_too_many_items(&err) {
            let count = phases.iter().map(|p| p.prices.len()).max().unwrap_or(0);
            return ControlError::TooManyItems {
                count,
                max: MAX_PHASE_ITEMS,
            };
        }
        err.into_control(operation, org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stripe::InMemoryLedger;
    use crate::application::handlers::catalog::PushCatalogHandler;
    use crate::domain::catalog::CatalogEntry;
    use crate::domain::foundation::Timestamp;
    use crate::ports::{ScheduleStatus, SubscriptionStatus};

    fn fp(name: &str) -> FeaturePlan {
        FeaturePlan::parse(&format!("feature:{}@plan:p@0", name)).unwrap()
    }

    fn org() -> OrgId {
        OrgId::parse("org:acme").unwrap()
    }

    struct Fixture {
        ledger: InMemoryLedger,
        orgs: OrgDirectory,
        handler: ScheduleOrgHandler,
    }

    async fn fixture(features: &[&str]) -> Fixture {
        let ledger = InMemoryLedger::new();
        let shared: Arc<dyn LedgerClient> = Arc::new(ledger.clone());
        let entries = features.iter().map(|f| CatalogEntry::new(fp(f))).collect();
        PushCatalogHandler::new(Arc::clone(&shared), 5, 10)
            .handle(entries, |_| {})
            .await;
        let orgs = OrgDirectory::new(Arc::clone(&shared), 10);
        let handler = ScheduleOrgHandler::new(shared, orgs.clone());
        ledger.clear_calls();
        Fixture {
            ledger,
            orgs,
            handler,
        }
    }

    impl Fixture {
        async fn schedule(&self, phases: Vec<Phase>) -> Result<ScheduleOutcome, ControlError> {
            self.handler.handle(ScheduleOrgCommand::new(org(), phases)).await
        }

        async fn live_subscriptions(&self) -> Vec<crate::ports::LedgerSubscription> {
            let customer = self.orgs.resolve(&org()).await.unwrap();
            self.ledger
                .subscriptions_of(&customer)
                .into_iter()
                .filter(|s| !s.status.is_ended())
                .collect()
        }

        async fn item_keys(&self) -> Vec<String> {
            let subs = self.live_subscriptions().await;
            let mut keys: Vec<String> = subs[0]
                .items
                .iter()
                .filter_map(|i| i.price.lookup_key.clone())
                .collect();
            keys.sort();
            keys
        }
    }

    fn in_days(days: i64) -> Timestamp {
        Timestamp::now().add_days(days)
    }

    #[tokio::test]
    async fn creates_schedule_for_new_org() {
        let f = fixture(&["a", "b"]).await;
        let outcome = f.schedule(vec![Phase::immediate(vec![fp("a"), fp("b")])]).await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Created { .. }));
        assert_eq!(
            f.item_keys().await,
            vec!["feature:a@plan:p@0", "feature:b@plan:p@0"]
        );
    }

    #[tokio::test]
    async fn immediate_phase_replaces_current_features() {
        let f = fixture(&["a", "b"]).await;
        f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap();
        let outcome = f.schedule(vec![Phase::immediate(vec![fp("b")])]).await.unwrap();

        assert!(matches!(outcome, ScheduleOutcome::Updated { .. }));
        assert_eq!(f.item_keys().await, vec!["feature:b@plan:p@0"]);
        assert_eq!(f.live_subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn dated_phase_follows_current_phase() {
        let f = fixture(&["a", "b"]).await;
        f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap();
        let at = in_days(30);
        let outcome = f.schedule(vec![Phase::at(at, vec![fp("b")])]).await.unwrap();

        let ScheduleOutcome::Updated { schedule_id } = outcome else {
            panic!("expected an update, got {outcome:?}");
        };
        let schedule = f.ledger.schedule(&schedule_id).unwrap();
        assert_eq!(schedule.phases.len(), 2);
        assert_eq!(schedule.phases[0].end, Some(at));
        assert_eq!(schedule.phases[1].start, at);
        assert_eq!(f.item_keys().await, vec!["feature:a@plan:p@0"]);
    }

    async fn current_schedule(f: &Fixture, features: &[&str]) -> LedgerSchedule {
        let outcome = f
            .schedule(vec![Phase::immediate(features.iter().map(|n| fp(n)).collect())])
            .await
            .unwrap();
        let (ScheduleOutcome::Created { schedule_id } | ScheduleOutcome::Updated { schedule_id }) =
            outcome
        else {
            panic!("expected a schedule, got {outcome:?}");
        };
        f.ledger.schedule(&schedule_id).unwrap()
    }

    #[tokio::test]
    async fn dated_cancellation_cuts_the_current_phase() {
        let f = fixture(&["a"]).await;
        let before = current_schedule(&f, &["a"]).await;
        let at = in_days(10);

        let outcome = f.schedule(vec![Phase::cancel_at(at)]).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::Updated { schedule_id: before.id.clone() });
        let schedule = f.ledger.schedule(&before.id).unwrap();
        assert_eq!(schedule.end_behavior, EndBehavior::Cancel);
        assert_eq!(schedule.phases.len(), 1);
        assert_eq!(schedule.phases[0].start, before.phases[0].start);
        assert_eq!(schedule.phases[0].end, Some(at));
        assert_eq!(f.item_keys().await, vec!["feature:a@plan:p@0"]);
    }

    #[tokio::test]
    async fn backdated_phase_replaces_the_current_phase() {
        let f = fixture(&["a", "b"]).await;
        let before = current_schedule(&f, &["a"]).await;

        let outcome = f
            .schedule(vec![Phase::at(in_days(-5), vec![fp("b")])])
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Updated { schedule_id: before.id.clone() });
        let schedule = f.ledger.schedule(&before.id).unwrap();
        assert_eq!(schedule.phases.len(), 1);
        assert_eq!(schedule.phases[0].start, before.phases[0].start);
        assert_eq!(schedule.end_behavior, EndBehavior::Release);
        assert_eq!(f.item_keys().await, vec!["feature:b@plan:p@0"]);
    }

    #[tokio::test]
    async fn backdated_cancellation_cancels_the_subscription() {
        let f = fixture(&["a"]).await;
        current_schedule(&f, &["a"]).await;
        f.ledger.clear_calls();

        let outcome = f.schedule(vec![Phase::cancel_at(in_days(-1))]).await.unwrap();

        assert!(matches!(outcome, ScheduleOutcome::Canceled { .. }));
        assert_eq!(f.ledger.call_count("update_schedule"), 0);
        assert_eq!(f.ledger.call_count("cancel_subscription"), 1);
        assert!(f.live_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn trailing_cancellation_ends_the_schedule() {
        let f = fixture(&["a"]).await;
        let outcome = f
            .schedule(vec![
                Phase::immediate(vec![fp("a")]),
                Phase::cancel_at(in_days(10)),
            ])
            .await
            .unwrap();
        let ScheduleOutcome::Created { schedule_id } = outcome else {
            panic!("expected a create, got {outcome:?}");
        };
        let schedule = f.ledger.schedule(&schedule_id).unwrap();
        assert_eq!(schedule.end_behavior, EndBehavior::Cancel);
        assert_eq!(schedule.phases.len(), 1);
    }

    #[tokio::test]
    async fn cancel_now_cancels_with_proration() {
        let f = fixture(&["a"]).await;
        f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap();
        let outcome = f.schedule(vec![Phase::cancel_now()]).await.unwrap();

        assert!(matches!(outcome, ScheduleOutcome::Canceled { .. }));
        assert!(f.live_subscriptions().await.is_empty());
        let cancel = f
            .ledger
            .calls()
            .into_iter()
            .find(|c| c.method == "cancel_subscription")
            .unwrap();
        assert_eq!(cancel.args[1..], ["true".to_string(), "true".to_string()]);
    }

    #[tokio::test]
    async fn cancelling_without_subscription_is_a_no_op() {
        let f = fixture(&["a"]).await;
        let outcome = f.schedule(vec![Phase::cancel_now()]).await.unwrap();
        assert_eq!(outcome, ScheduleOutcome::Unchanged);
        assert_eq!(f.ledger.call_count("create_schedule"), 0);
        assert_eq!(f.ledger.call_count("cancel_subscription"), 0);
    }

    #[tokio::test]
    async fn unknown_feature_fails_before_any_mutation() {
        let f = fixture(&["a"]).await;
        let err = f
            .schedule(vec![Phase::immediate(vec![fp("a"), fp("nope")])])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::FeatureNotFound(_)));
        assert_eq!(f.ledger.call_count("create_schedule"), 0);
    }

    #[tokio::test]
    async fn invalid_phases_make_no_calls() {
        let f = fixture(&["a"]).await;
        let err = f
            .schedule(vec![Phase::cancel_now(), Phase::immediate(vec![fp("a")])])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidPhase(_)));
        assert!(f.ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn released_schedule_is_replaced_and_retried_once() {
        let f = fixture(&["a", "b"]).await;
        f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap();
        f.ledger.release_schedule_before_next_update();

        let outcome = f.schedule(vec![Phase::immediate(vec![fp("b")])]).await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Updated { .. }));
        assert_eq!(f.ledger.call_count("update_schedule"), 2);
        assert_eq!(f.ledger.call_count("create_schedule_from_subscription"), 1);
        assert_eq!(f.item_keys().await, vec!["feature:b@plan:p@0"]);
    }

    #[tokio::test]
    async fn subscription_without_schedule_gets_one_attached() {
        let f = fixture(&["a", "b"]).await;
        let ScheduleOutcome::Created { schedule_id } =
            f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap()
        else {
            panic!("expected a create");
        };
        f.ledger.release_schedule(&schedule_id);

        f.schedule(vec![Phase::immediate(vec![fp("b")])]).await.unwrap();
        assert_eq!(f.ledger.call_count("create_schedule_from_subscription"), 1);
        assert_eq!(
            f.ledger.schedule(&schedule_id).unwrap().status,
            ScheduleStatus::Released
        );
        assert_eq!(f.item_keys().await, vec!["feature:b@plan:p@0"]);
    }

    #[tokio::test]
    async fn deleted_customer_surfaces_as_unexpected_missing_org() {
        let f = fixture(&["a"]).await;
        let customer = f.orgs.ensure(&org(), None).await.unwrap();
        f.ledger.delete_customer(&customer);

        let err = f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap_err();
        assert!(matches!(err, ControlError::UnexpectedMissingOrg(_)));
        assert!(matches!(
            f.orgs.resolve(&org()).await.unwrap_err(),
            ControlError::OrgNotFound(_)
        ));
    }

    #[tokio::test]
    async fn ledger_item_limit_maps_to_too_many_items() {
        let f = fixture(&["a"]).await;
        f.ledger.set_method_error(
            "create_schedule",
            LedgerError::validation("A phase can have at most 20 items."),
        );
        let err = f.schedule(vec![Phase::immediate(vec![fp("a")])]).await.unwrap_err();
        assert!(matches!(err, ControlError::TooManyItems { count: 1, max: 20 }));
    }

    #[tokio::test]
    async fn trial_phase_marks_subscription_trialing() {
        let f = fixture(&["a"]).await;
        f.schedule(vec![
            Phase::immediate(vec![fp("a")]).with_trial(true),
            Phase::at(in_days(14), vec![fp("a")]),
        ])
        .await
        .unwrap();
        let subs = f.live_subscriptions().await;
        assert_eq!(subs[0].status, SubscriptionStatus::Trialing);
    }
}
