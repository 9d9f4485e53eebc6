//! PushCatalogHandler - publishes catalog entries as ledger prices.
//!
//! Plans are immutable once published. Before any of its prices are created,
//! a plan is claimed by creating an inactive sentinel product whose id is
//! derived from the plan id; a plan whose sentinel already exists reports
//! every entry as `PlanExists`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use super::price_codec;
use crate::application::keys::plan_sentinel_id;
use crate::application::loader::Loader;
use crate::domain::catalog::{validate_entries, CatalogEntry};
use crate::domain::foundation::{FeaturePlan, PlanId};
use crate::domain::metadata;
use crate::ports::{CreateProductRequest, LedgerClient, LedgerError};

/// Outcome of publishing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Created,
    /// The feature was already published; nothing changed.
    FeatureExists,
    /// The plan was already published; nothing was sent for this entry.
    PlanExists,
    Failed,
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PushStatus::Created => "created",
            PushStatus::FeatureExists => "feature_exists",
            PushStatus::PlanExists => "plan_exists",
            PushStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Per-entry push result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushResult {
    pub feature_plan: FeaturePlan,
    pub status: PushStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Ledger price id of a created entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl PushResult {
    fn new(feature_plan: FeaturePlan, status: PushStatus) -> Self {
        Self {
            feature_plan,
            status,
            reason: None,
            provider_id: None,
        }
    }

    fn failed(feature_plan: FeaturePlan, reason: impl ToString) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(feature_plan, PushStatus::Failed)
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == PushStatus::Failed
    }
}

/// Handler for publishing catalog entries.
///
/// Every remote call holds a worker permit, so at most `workers` calls are
/// in flight per handler.
pub struct PushCatalogHandler {
    ledger: Arc<dyn LedgerClient>,
    /// Plan id -> token of the push that claimed it in this process.
    plan_gate: Loader<PlanId, Uuid>,
    workers: Semaphore,
}

impl PushCatalogHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>, workers: usize, capacity: usize) -> Self {
        Self {
            ledger,
            plan_gate: Loader::with_capacity(capacity),
            workers: Semaphore::new(workers.max(1)),
        }
    }

    /// Publishes `entries`, reporting each result through `on_result` as its
    /// plan completes. Returns every result, sorted by feature plan.
    pub async fn handle<F>(&self, entries: Vec<CatalogEntry>, on_result: F) -> Vec<PushResult>
    where
        F: Fn(&PushResult) + Sync,
    {
        // 1. Group by plan
        let mut by_plan: BTreeMap<PlanId, Vec<CatalogEntry>> = BTreeMap::new();
        for entry in entries {
            by_plan.entry(entry.plan().clone()).or_default().push(entry);
        }

        // 2. Publish plans concurrently
        let on_result = &on_result;
        let plans = by_plan.into_iter().map(|(plan, entries)| async move {
            let mut results = self.push_plan(&plan, entries).await;
            results.sort_by(|a, b| a.feature_plan.cmp(&b.feature_plan));
            for result in &results {
                on_result(result);
            }
            results
        });
        let mut results: Vec<PushResult> = join_all(plans).await.into_iter().flatten().collect();
        results.sort_by(|a, b| a.feature_plan.cmp(&b.feature_plan));
        results
    }

    async fn push_plan(&self, plan: &PlanId, entries: Vec<CatalogEntry>) -> Vec<PushResult> {
        // 1. Validate locally; an invalid entry fails the whole plan
        if let Err(err) = validate_entries(&entries) {
            tracing::warn!(plan = %plan, error = %err, "Plan failed validation");
            return entries
                .into_iter()
                .map(|e| PushResult::failed(e.feature_plan, &err))
                .collect();
        }

        // 2. Claim the plan
        match self.claim(plan).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(plan = %plan, "Plan already published");
                return entries
                    .into_iter()
                    .map(|e| PushResult::new(e.feature_plan, PushStatus::PlanExists))
                    .collect();
            }
            Err(err) => {
                tracing::warn!(plan = %plan, error = %err, "Could not claim plan");
                return entries
                    .into_iter()
                    .map(|e| PushResult::failed(e.feature_plan, &err))
                    .collect();
            }
        }

        // 3. Create one price per entry
        let results = join_all(entries.iter().map(|e| self.push_entry(e))).await;

        let created = results.iter().filter(|r| r.status == PushStatus::Created).count();
        let failed = results.iter().filter(|r| r.is_failure()).count();
        tracing::info!(plan = %plan, created, failed, total = results.len(), "Pushed plan");
        results
    }

    /// Whether this push claimed `plan`. Concurrent pushes of one plan in
    /// this process share the first claim, so only one of them wins.
    async fn claim(&self, plan: &PlanId) -> Result<bool, LedgerError> {
        let (this, token) = (self, Uuid::new_v4());
        let owner = this
            .plan_gate
            .get_or_load(plan.clone(), move || async move {
                let _permit = this.permit().await?;
                let sentinel = CreateProductRequest {
                    id: plan_sentinel_id(plan),
                    name: plan.to_string(),
                    active: false,
                    metadata: HashMap::from([(metadata::PLAN.to_string(), plan.to_string())]),
                };
                match this.ledger.create_product(sentinel).await {
                    Ok(_) => Ok(token),
                    Err(err) if err.is_already_exists() => Ok(Uuid::nil()),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(owner == token)
    }

    async fn push_entry(&self, entry: &CatalogEntry) -> PushResult {
        let feature_plan = entry.feature_plan.clone();
        let permit = match self.permit().await {
            Ok(permit) => permit,
            Err(err) => return PushResult::failed(feature_plan, err),
        };
        let outcome = self.ledger.create_price(price_codec::encode(entry)).await;
        drop(permit);

        match outcome {
            Ok(price) => {
                tracing::debug!(feature = %feature_plan, price = %price.id, "Created price");
                PushResult {
                    provider_id: Some(price.id),
                    ..PushResult::new(feature_plan, PushStatus::Created)
                }
            }
            Err(err) if err.is_already_exists() => {
                PushResult::new(feature_plan, PushStatus::FeatureExists)
            }
            Err(err) => {
                tracing::warn!(feature = %feature_plan, error = %err, "Failed to create price");
                PushResult::failed(feature_plan, err)
            }
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, LedgerError> {
        self.workers
            .acquire()
            .await
            .map_err(|_| LedgerError::provider("push worker pool closed"))
    }
}
