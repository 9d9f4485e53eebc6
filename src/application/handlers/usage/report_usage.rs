//! ReportUsageHandler - records metered usage against an org's subscription.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::application::cancel::Cancellation;
use crate::application::handlers::org::OrgDirectory;
use crate::application::handlers::schedule::current_subscription;
use crate::application::retry::Backoff;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{Effective, FeatureName, FeaturePlan, OrgId};
use crate::domain::usage::UsageAction;
use crate::ports::{LedgerClient, SubscriptionItem, UsageRecordRequest};

/// Command to report usage of a metered feature.
#[derive(Debug, Clone)]
pub struct ReportUsageCommand {
    pub org: OrgId,
    pub feature: FeatureName,
    pub quantity: i64,
    /// When the usage happened; `Immediate` lets the ledger stamp it.
    pub at: Effective,
    /// Replace the total at `at` instead of adding to it.
    pub clobber: bool,
}

impl ReportUsageCommand {
    pub fn new(org: OrgId, feature: FeatureName, quantity: i64) -> Self {
        Self {
            org,
            feature,
            quantity,
            at: Effective::Immediate,
            clobber: false,
        }
    }

    pub fn at(mut self, at: Effective) -> Self {
        self.at = at;
        self
    }

    pub fn clobber(mut self, clobber: bool) -> Self {
        self.clobber = clobber;
        self
    }
}

/// Handler for usage reports.
///
/// Retryable ledger failures are retried with capped backoff under one
/// idempotency key until the deadline passes.
pub struct ReportUsageHandler {
    ledger: Arc<dyn LedgerClient>,
    orgs: OrgDirectory,
    backoff: Backoff,
    deadline: Duration,
}

impl ReportUsageHandler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        orgs: OrgDirectory,
        backoff: Backoff,
        deadline: Duration,
    ) -> Self {
        Self {
            ledger,
            orgs,
            backoff,
            deadline,
        }
    }

    pub async fn handle(
        &self,
        cmd: ReportUsageCommand,
        mut cancel: Cancellation,
    ) -> Result<(), ControlError> {
        cancel.check()?;

        // 1. Find the subscription item billing the feature
        let item = self.find_item(&cmd.org, &cmd.feature).await?;
        let feature_plan = item_feature(&item).ok_or_else(|| ControlError::feature_not_found(&cmd.feature))?;
        if !item.price.metered {
            return Err(ControlError::FeatureNotMetered(feature_plan));
        }

        // 2. Post the record, one key across retries
        let request = UsageRecordRequest {
            subscription_item_id: item.id,
            quantity: cmd.quantity,
            timestamp: cmd.at,
            action: UsageAction::from_clobber(cmd.clobber),
            idempotency_key: Uuid::new_v4().to_string(),
        };
        match tokio::time::timeout(self.deadline, self.post(&cmd.org, &request, &mut cancel)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(org = %cmd.org, feature = %feature_plan, "Usage report timed out");
                return Err(ControlError::DeadlineExceeded {
                    operation: "report_usage",
                    millis: self.deadline.as_millis() as u64,
                });
            }
        }

        tracing::debug!(
            org = %cmd.org,
            feature = %feature_plan,
            quantity = cmd.quantity,
            action = request.action.as_ledger_str(),
            "Reported usage"
        );
        Ok(())
    }

    async fn find_item(&self, org: &OrgId, feature: &FeatureName) -> Result<SubscriptionItem, ControlError> {
        let customer_id = self.orgs.resolve(org).await?;
        let subscription = current_subscription(self.ledger.as_ref(), &customer_id)
            .await
            .map_err(|e| self.orgs.normalize(org, "list_subscriptions", e))?
            .ok_or_else(|| ControlError::feature_not_found(feature))?;

        subscription
            .items
            .into_iter()
            .find(|item| item_feature(item).map_or(false, |fp| fp.feature() == feature))
            .ok_or_else(|| ControlError::feature_not_found(feature))
    }

    async fn post(
        &self,
        org: &OrgId,
        request: &UsageRecordRequest,
        cancel: &mut Cancellation,
    ) -> Result<(), ControlError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                result = self.ledger.create_usage_record(request.clone()) => result,
                _ = cancel.cancelled() => return Err(ControlError::Cancelled),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.retryable => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        org = %org,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Usage record failed; retrying"
                    );
                    cancel.sleep(delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(self.orgs.normalize(org, "create_usage_record", err)),
            }
        }
    }
}

fn item_feature(item: &SubscriptionItem) -> Option<FeaturePlan> {
    item.price
        .lookup_key
        .as_deref()
        .and_then(|key| FeaturePlan::parse(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stripe::InMemoryLedger;
    use crate::application::handlers::catalog::PushCatalogHandler;
    use crate::application::handlers::schedule::{ScheduleOrgCommand, ScheduleOrgHandler};
    use crate::domain::catalog::{Aggregate, CatalogEntry, Tier, INF};
    use crate::domain::schedule::Phase;
    use crate::ports::LedgerError;

    fn org() -> OrgId {
        OrgId::parse("org:acme").unwrap()
    }

    fn feature(name: &str) -> FeatureName {
        FeatureName::parse(&format!("feature:{}", name)).unwrap()
    }

    fn fp(name: &str) -> FeaturePlan {
        FeaturePlan::parse(&format!("feature:{}@plan:p@0", name)).unwrap()
    }

    struct Fixture {
        ledger: InMemoryLedger,
        handler: ReportUsageHandler,
    }

    async fn fixture(deadline: Duration) -> Fixture {
        let ledger = InMemoryLedger::new();
        let shared: Arc<dyn LedgerClient> = Arc::new(ledger.clone());

        let mut api = CatalogEntry::new(fp("api"));
        api.aggregate = Some(Aggregate::Sum);
        api.tiers = vec![Tier { upto: INF, price: 0.1, base: 0 }];
        PushCatalogHandler::new(Arc::clone(&shared), 5, 10)
            .handle(vec![api, CatalogEntry::new(fp("seats"))], |_| {})
            .await;

        let orgs = OrgDirectory::new(Arc::clone(&shared), 10);
        ScheduleOrgHandler::new(Arc::clone(&shared), orgs.clone())
            .handle(ScheduleOrgCommand::new(
                org(),
                vec![Phase::immediate(vec![fp("api"), fp("seats")])],
            ))
            .await
            .unwrap();

        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        Fixture {
            ledger,
            handler: ReportUsageHandler::new(shared, orgs, backoff, deadline),
        }
    }

    impl Fixture {
        async fn report(&self, cmd: ReportUsageCommand) -> Result<(), ControlError> {
            self.handler.handle(cmd, Cancellation::none()).await
        }

        async fn total(&self) -> i64 {
            let item = self.handler.find_item(&org(), &feature("api")).await.unwrap();
            self.ledger.usage_total(&item.id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn increments_accumulate() {
        let f = fixture(Duration::from_secs(3)).await;
        f.report(ReportUsageCommand::new(org(), feature("api"), 9)).await.unwrap();
        f.report(ReportUsageCommand::new(org(), feature("api"), 1)).await.unwrap();
        assert_eq!(f.total().await, 10);
    }

    #[tokio::test]
    async fn clobber_sets_the_total() {
        let f = fixture(Duration::from_secs(3)).await;
        let at = Effective::At(crate::domain::foundation::Timestamp::now());
        for _ in 0..3 {
            f.report(ReportUsageCommand::new(org(), feature("api"), 5).at(at).clobber(true))
                .await
                .unwrap();
        }
        assert_eq!(f.total().await, 5);
    }

    #[tokio::test]
    async fn licensed_feature_is_not_metered() {
        let f = fixture(Duration::from_secs(3)).await;
        let err = f
            .report(ReportUsageCommand::new(org(), feature("seats"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::FeatureNotMetered(ref fp) if fp.feature() == &feature("seats")));
    }

    #[tokio::test]
    async fn feature_outside_subscription_is_not_found() {
        let f = fixture(Duration::from_secs(3)).await;
        let err = f
            .report(ReportUsageCommand::new(org(), feature("storage"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::FeatureNotFound(_)));
    }

    #[tokio::test]
    async fn retryable_failures_reuse_the_idempotency_key() {
        let f = fixture(Duration::from_secs(3)).await;
        f.ledger.fail_next("create_usage_record", LedgerError::network("reset"));
        f.ledger.fail_next("create_usage_record", LedgerError::network("reset"));
        f.ledger.clear_calls();

        f.report(ReportUsageCommand::new(org(), feature("api"), 4)).await.unwrap();

        let keys: Vec<String> = f
            .ledger
            .calls()
            .into_iter()
            .filter(|c| c.method == "create_usage_record")
            .map(|c| c.args[2].clone())
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert_eq!(f.total().await, 4);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_returned() {
        let f = fixture(Duration::from_secs(3)).await;
        f.ledger.fail_next("create_usage_record", LedgerError::validation("bad"));
        let err = f
            .report(ReportUsageCommand::new(org(), feature("api"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Ledger { operation: "create_usage_record", .. }));
    }

    #[tokio::test]
    async fn persistent_failure_hits_the_deadline() {
        let f = fixture(Duration::from_millis(50)).await;
        f.ledger.set_method_error("create_usage_record", LedgerError::network("down"));
        let err = f
            .report(ReportUsageCommand::new(org(), feature("api"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeadlineExceeded { millis: 50, .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let f = fixture(Duration::from_secs(30)).await;
        f.ledger.set_method_error("create_usage_record", LedgerError::network("down"));
        let (handle, token) = Cancellation::pair();

        let report = f
            .handler
            .handle(ReportUsageCommand::new(org(), feature("api"), 1), token);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (result, ()) = tokio::join!(report, cancel);
        assert!(matches!(result, Err(ControlError::Cancelled)));
    }
}
