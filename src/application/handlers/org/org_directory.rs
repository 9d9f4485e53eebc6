//! OrgDirectory - maps orgs to ledger customers.
//!
//! The ledger is the system of record: a customer belongs to an org when its
//! metadata carries `entitle.org`. The directory memoizes that mapping in a
//! bounded LRU and single-flights concurrent misses per org, so N callers
//! ensuring the same org trigger one scan and at most one create.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::application::keys::customer_idempotency_key;
use crate::application::loader::Loader;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{ClockId, OrgId};
use crate::domain::metadata;
use crate::domain::org::{OrgInfo, OrgRecord};
use crate::ports::{
    is_missing_customer, CreateCustomerRequest, LedgerClient, LedgerCustomer, LedgerError,
    PageRequest, UpdateCustomerRequest,
};

/// Cache key: the same org under different clocks maps to different customers.
type OrgKey = (OrgId, Option<ClockId>);

/// Org identity cache over the ledger's customers.
///
/// Clones share the cache. [`OrgDirectory::with_clock`] scopes lookups and
/// creates to a simulated clock.
#[derive(Clone)]
pub struct OrgDirectory {
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<Loader<OrgKey, String>>,
    clock: Option<ClockId>,
}

impl OrgDirectory {
    pub fn new(ledger: Arc<dyn LedgerClient>, capacity: usize) -> Self {
        Self {
            ledger,
            cache: Arc::new(Loader::with_capacity(capacity)),
            clock: None,
        }
    }

    /// Same directory, with orgs created and found under `clock`.
    pub fn with_clock(&self, clock: ClockId) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            cache: Arc::clone(&self.cache),
            clock: Some(clock),
        }
    }

    pub fn clock(&self) -> Option<&ClockId> {
        self.clock.as_ref()
    }

    fn key(&self, org: &OrgId) -> OrgKey {
        (org.clone(), self.clock.clone())
    }

    /// Customer id of `org`, or `OrgNotFound` when no customer is tagged.
    pub async fn resolve(&self, org: &OrgId) -> Result<String, ControlError> {
        let this = self;
        this.cache
            .get_or_load(this.key(org), move || async move {
                this.find(org)
                    .await?
                    .map(|customer| customer.id)
                    .ok_or_else(|| ControlError::OrgNotFound(org.clone()))
            })
            .await
    }

    /// Finds or creates the customer of `org`.
    ///
    /// When `info` is given it is validated before any remote call, written
    /// on create, and applied as an update to a customer that already existed.
    pub async fn ensure(&self, org: &OrgId, info: Option<&OrgInfo>) -> Result<String, ControlError> {
        if let Some(info) = info {
            info.validate()?;
        }

        let created = AtomicBool::new(false);
        let (this, created_ref) = (self, &created);
        let customer_id = this
            .cache
            .get_or_load(this.key(org), move || async move {
                if let Some(existing) = this.find(org).await? {
                    return Ok(existing.id);
                }
                let customer = this
                    .ledger
                    .create_customer(this.create_request(org, info))
                    .await
                    .map_err(|e| e.into_control("create_customer", org))?;
                created_ref.store(true, Ordering::SeqCst);
                tracing::info!(org = %org, customer = %customer.id, "Created ledger customer");
                Ok::<_, ControlError>(customer.id)
            })
            .await?;

        if let Some(info) = info {
            if !created.load(Ordering::SeqCst) {
                self.ledger
                    .update_customer(&customer_id, update_request(info))
                    .await
                    .map_err(|e| self.normalize(org, "update_customer", e))?;
                tracing::debug!(org = %org, customer = %customer_id, "Updated ledger customer");
            }
        }
        Ok(customer_id)
    }

    /// Reads back the org's customer details.
    pub async fn lookup(&self, org: &OrgId) -> Result<OrgRecord, ControlError> {
        let customer_id = self.resolve(org).await?;
        let customer = self
            .ledger
            .get_customer(&customer_id)
            .await
            .map_err(|e| self.normalize(org, "get_customer", e))?;
        Ok(OrgRecord {
            org: org.clone(),
            customer_id: customer.id,
            info: OrgInfo::from_customer_fields(
                customer.email,
                customer.name,
                customer.description,
                customer.phone,
                &customer.metadata,
            ),
            clock: customer.test_clock,
        })
    }

    pub fn invalidate(&self, org: &OrgId) {
        self.cache.invalidate(&self.key(org));
    }

    /// Evicts `org` and reports that its cached customer vanished.
    pub fn missing(&self, org: &OrgId) -> ControlError {
        tracing::warn!(org = %org, "Cached customer no longer exists; evicting");
        self.invalidate(org);
        ControlError::UnexpectedMissingOrg(org.clone())
    }

    /// Wraps a ledger error, turning a missing customer into
    /// `UnexpectedMissingOrg`.
    pub fn normalize(&self, org: &OrgId, operation: &'static str, err: LedgerError) -> ControlError {
        if is_missing_customer(&err) {
            self.missing(org)
        } else {
            err.into_control(operation, org)
        }
    }

    /// Scans customers, newest first, for the one tagged with `org`.
    async fn find(&self, org: &OrgId) -> Result<Option<LedgerCustomer>, ControlError> {
        let mut page = PageRequest::default();
        loop {
            let batch = self
                .ledger
                .list_customers(page)
                .await
                .map_err(|e| e.into_control("list_customers", org))?;
            let cursor = batch.data.last().map(|c| c.id.clone());
            if let Some(found) = batch.data.into_iter().find(|c| self.owns(org, c)) {
                return Ok(Some(found));
            }
            match cursor {
                Some(id) if batch.has_more => page = PageRequest::after(id),
                _ => return Ok(None),
            }
        }
    }

    fn owns(&self, org: &OrgId, customer: &LedgerCustomer) -> bool {
        customer.metadata.get(metadata::ORG).map(String::as_str) == Some(org.as_str())
            && customer.test_clock == self.clock
    }

    fn create_request(&self, org: &OrgId, info: Option<&OrgInfo>) -> CreateCustomerRequest {
        let info = info.cloned().unwrap_or_default();
        let mut meta: HashMap<String, String> = info.metadata;
        meta.insert(metadata::ORG.to_string(), org.to_string());
        CreateCustomerRequest {
            idempotency_key: Some(customer_idempotency_key(org, self.clock.as_ref())),
            email: info.email,
            name: info.name,
            description: info.description,
            phone: info.phone,
            metadata: meta,
            test_clock: self.clock.clone(),
        }
    }
}

fn update_request(info: &OrgInfo) -> UpdateCustomerRequest {
    UpdateCustomerRequest {
        email: info.email.clone(),
        name: info.name.clone(),
        description: info.description.clone(),
        phone: info.phone.clone(),
        metadata: info.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stripe::InMemoryLedger;

    fn org(s: &str) -> OrgId {
        OrgId::parse(s).unwrap()
    }

    fn directory() -> (InMemoryLedger, OrgDirectory) {
        let ledger = InMemoryLedger::new();
        let directory = OrgDirectory::new(Arc::new(ledger.clone()), 100);
        (ledger, directory)
    }

    #[tokio::test]
    async fn resolve_unknown_org_is_not_found() {
        let (_, directory) = directory();
        let err = directory.resolve(&org("org:nobody")).await.unwrap_err();
        assert!(matches!(err, ControlError::OrgNotFound(_)));
    }

    #[tokio::test]
    async fn ensure_creates_once_then_hits_cache() {
        let (ledger, directory) = directory();
        let a = directory.ensure(&org("org:a"), None).await.unwrap();
        let b = directory.ensure(&org("org:a"), None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(ledger.call_count("create_customer"), 1);
        assert_eq!(ledger.call_count("list_customers"), 1);
        assert_eq!(directory.resolve(&org("org:a")).await.unwrap(), a);
    }

    #[tokio::test]
    async fn reserved_metadata_fails_before_any_call() {
        let (ledger, directory) = directory();
        let mut info = OrgInfo::default();
        info.metadata.insert("entitle.plan".into(), "x".into());
        let err = directory.ensure(&org("org:a"), Some(&info)).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidMetadata(_)));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn ensure_updates_existing_customer_info() {
        let (ledger, directory) = directory();
        directory.ensure(&org("org:a"), None).await.unwrap();

        let info = OrgInfo {
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        directory.ensure(&org("org:a"), Some(&info)).await.unwrap();
        assert_eq!(ledger.call_count("update_customer"), 1);

        let record = directory.lookup(&org("org:a")).await.unwrap();
        assert_eq!(record.info.email.as_deref(), Some("a@example.com"));
        assert!(record.info.metadata.is_empty());
    }

    #[tokio::test]
    async fn deleted_customer_is_unexpected_and_evicted() {
        let (ledger, directory) = directory();
        let id = directory.ensure(&org("org:a"), None).await.unwrap();
        ledger.delete_customer(&id);

        let err = directory.lookup(&org("org:a")).await.unwrap_err();
        assert!(matches!(err, ControlError::UnexpectedMissingOrg(_)));
        let err = directory.resolve(&org("org:a")).await.unwrap_err();
        assert!(matches!(err, ControlError::OrgNotFound(_)));
    }

    #[tokio::test]
    async fn clock_scoped_orgs_are_distinct_customers() {
        let (ledger, directory) = directory();
        let clock = ledger
            .create_test_clock("t", crate::domain::foundation::Timestamp::now())
            .await
            .unwrap();
        let plain = directory.ensure(&org("org:a"), None).await.unwrap();
        let scoped = directory
            .with_clock(clock.id.clone())
            .ensure(&org("org:a"), None)
            .await
            .unwrap();
        assert_ne!(plain, scoped);

        let record = directory.with_clock(clock.id.clone()).lookup(&org("org:a")).await.unwrap();
        assert_eq!(record.clock, Some(clock.id));
    }

    #[tokio::test]
    async fn lost_create_race_is_idempotent() {
        let (ledger, directory) = directory();
        ledger.fail_next("create_customer", LedgerError::network("reset"));
        assert!(directory.ensure(&org("org:a"), None).await.is_err());
        directory.ensure(&org("org:a"), None).await.unwrap();
        assert_eq!(ledger.customers_tagged(metadata::ORG, "org:a").len(), 1);
    }
}
