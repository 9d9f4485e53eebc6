//! Control - the engine's entry point.
//!
//! Owns the ledger client and the state that must be shared between calls
//! (the org identity cache and the per-plan push gate). Handlers are built on
//! demand from that shared state, so `Control` is cheap to clone and can be
//! handed to as many tasks as needed.

use std::sync::Arc;

use crate::application::cancel::Cancellation;
use crate::application::handlers::{
    LookupLimitsHandler, LookupPhasesHandler, OrgDirectory, PullCatalogHandler, PullQuery,
    PushCatalogHandler, PushResult, ReportUsageCommand, ReportUsageHandler, ScheduleOrgCommand,
    ScheduleOrgHandler, ScheduleOutcome, SimulatedClockHandler,
};
use crate::config::EngineConfig;
use crate::domain::catalog::{CatalogEntry, PricingModel};
use crate::domain::errors::ControlError;
use crate::domain::foundation::{ClockId, FeaturePlan, OrgId, PlanId, Timestamp};
use crate::domain::org::{OrgInfo, OrgRecord};
use crate::domain::schedule::{OrgPhase, Phase};
use crate::domain::usage::Usage;
use crate::ports::{LedgerClient, LedgerClock};

#[derive(Clone)]
pub struct Control {
    ledger: Arc<dyn LedgerClient>,
    engine: EngineConfig,
    orgs: OrgDirectory,
    publisher: Arc<PushCatalogHandler>,
}

impl Control {
    pub fn new(ledger: Arc<dyn LedgerClient>, engine: EngineConfig) -> Self {
        let workers = engine.push_workers(ledger.is_live());
        tracing::debug!(live = ledger.is_live(), workers, "Building control");
        Self {
            orgs: OrgDirectory::new(Arc::clone(&ledger), engine.cache_capacity),
            publisher: Arc::new(PushCatalogHandler::new(
                Arc::clone(&ledger),
                workers,
                engine.cache_capacity,
            )),
            ledger,
            engine,
        }
    }

    /// A handle whose newly created orgs are attached to `clock`.
    ///
    /// The identity cache and push gate are shared with `self`.
    pub fn with_clock(&self, clock: ClockId) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            engine: self.engine.clone(),
            orgs: self.orgs.with_clock(clock),
            publisher: Arc::clone(&self.publisher),
        }
    }

    pub fn is_live(&self) -> bool {
        self.ledger.is_live()
    }

    pub fn clock(&self) -> Option<&ClockId> {
        self.orgs.clock()
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Catalog
    // ════════════════════════════════════════════════════════════════════════════

    /// Publishes `entries`, reporting each outcome to `on_result` as it lands.
    pub async fn push<F>(&self, entries: Vec<CatalogEntry>, on_result: F) -> Vec<PushResult>
    where
        F: Fn(&PushResult) + Sync,
    {
        self.publisher.handle(entries, on_result).await
    }

    pub async fn push_model(&self, model: &PricingModel) -> Vec<PushResult> {
        self.push(model.to_entries(), |_| {}).await
    }

    pub async fn pull(&self, query: &PullQuery) -> Result<Vec<CatalogEntry>, ControlError> {
        PullCatalogHandler::new(Arc::clone(&self.ledger))
            .handle(query)
            .await
    }

    pub async fn pull_model(&self, query: &PullQuery) -> Result<PricingModel, ControlError> {
        Ok(PricingModel::from_entries(&self.pull(query).await?))
    }

    /// Every published feature of `plans`.
    pub async fn expand_plans(&self, plans: &[PlanId]) -> Result<Vec<FeaturePlan>, ControlError> {
        PullCatalogHandler::new(Arc::clone(&self.ledger))
            .expand_plans(plans)
            .await
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Schedules
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn schedule(&self, cmd: ScheduleOrgCommand) -> Result<ScheduleOutcome, ControlError> {
        ScheduleOrgHandler::new(Arc::clone(&self.ledger), self.orgs.clone())
            .handle(cmd)
            .await
    }

    /// Shorthand for [`Control::schedule`] without org info.
    pub async fn schedule_phases(
        &self,
        org: &OrgId,
        phases: Vec<Phase>,
    ) -> Result<ScheduleOutcome, ControlError> {
        self.schedule(ScheduleOrgCommand::new(org.clone(), phases)).await
    }

    pub async fn lookup_phases(&self, org: &OrgId) -> Result<Vec<OrgPhase>, ControlError> {
        self.phases().handle(org).await
    }

    /// The phase in effect now, if any.
    pub async fn lookup_phase(&self, org: &OrgId) -> Result<Option<OrgPhase>, ControlError> {
        self.phases().current(org).await
    }

    fn phases(&self) -> LookupPhasesHandler {
        LookupPhasesHandler::new(Arc::clone(&self.ledger), self.orgs.clone())
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Usage
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn report(&self, cmd: ReportUsageCommand) -> Result<(), ControlError> {
        self.report_with_cancel(cmd, Cancellation::none()).await
    }

    pub async fn report_with_cancel(
        &self,
        cmd: ReportUsageCommand,
        cancel: Cancellation,
    ) -> Result<(), ControlError> {
        ReportUsageHandler::new(
            Arc::clone(&self.ledger),
            self.orgs.clone(),
            self.engine.usage_backoff(),
            self.engine.usage_deadline(),
        )
        .handle(cmd, cancel)
        .await
    }

    pub async fn lookup_limits(&self, org: &OrgId) -> Result<Vec<Usage>, ControlError> {
        LookupLimitsHandler::new(Arc::clone(&self.ledger), self.orgs.clone())
            .handle(org)
            .await
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Orgs
    // ════════════════════════════════════════════════════════════════════════════

    /// Creates the org's customer if needed; returns its customer id.
    pub async fn ensure_org(&self, org: &OrgId, info: Option<&OrgInfo>) -> Result<String, ControlError> {
        self.orgs.ensure(org, info).await
    }

    pub async fn resolve_org(&self, org: &OrgId) -> Result<String, ControlError> {
        self.orgs.resolve(org).await
    }

    pub async fn lookup_org(&self, org: &OrgId) -> Result<OrgRecord, ControlError> {
        self.orgs.lookup(org).await
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Simulated clocks
    // ════════════════════════════════════════════════════════════════════════════

    pub async fn create_clock(&self, name: &str, start: Timestamp) -> Result<ClockId, ControlError> {
        self.clocks().create(name, start).await
    }

    pub async fn advance_clock(&self, id: &ClockId, to: Timestamp) -> Result<(), ControlError> {
        self.clocks().advance(id, to).await
    }

    pub async fn wait_for_clock(
        &self,
        id: &ClockId,
        cancel: Cancellation,
    ) -> Result<LedgerClock, ControlError> {
        self.clocks().wait_until_ready(id, cancel).await
    }

    pub async fn clock_now(&self, id: &ClockId) -> Result<Timestamp, ControlError> {
        self.clocks().now(id).await
    }

    fn clocks(&self) -> SimulatedClockHandler {
        SimulatedClockHandler::new(Arc::clone(&self.ledger), self.engine.clock_backoff())
    }
}
