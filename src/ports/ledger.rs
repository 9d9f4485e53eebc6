//! Remote billing ledger port.
//!
//! Defines the contract for the billing provider the engine reconciles
//! against. Implementations translate these calls into the provider's API.
//!
//! # Design
//!
//! - **Provider shaped**: request and read types follow the provider's object
//!   model (customers, prices, subscriptions, schedules, usage records)
//! - **Typed pricing**: pricing enums use the domain types, so adapters do the
//!   string mapping once
//! - **Idempotent**: creates accept an idempotency key where the provider does

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

use crate::domain::catalog::{Aggregate, Divide, Interval, TierMode};
use crate::domain::errors::ControlError;
use crate::domain::foundation::{ClockId, Effective, Timestamp};
use crate::domain::usage::UsageAction;

/// Most lookup keys the provider accepts in one price query.
pub const MAX_LOOKUP_KEYS: usize = 10;

/// Port for the remote billing ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Whether this client talks to live (as opposed to test-mode) data.
    fn is_live(&self) -> bool;

    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError>;

    /// Fails with `NotFound` for unknown or deleted customers.
    async fn get_customer(&self, customer_id: &str) -> Result<LedgerCustomer, LedgerError>;

    async fn list_customers(&self, page: PageRequest) -> Result<Page<LedgerCustomer>, LedgerError>;

    async fn update_customer(
        &self,
        customer_id: &str,
        request: UpdateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError>;

    /// Creates a product; fails with `AlreadyExists` if the id is taken.
    async fn create_product(&self, request: CreateProductRequest) -> Result<String, LedgerError>;

    /// Creates a price; fails with `AlreadyExists` if the lookup key is taken.
    async fn create_price(&self, request: CreatePriceRequest) -> Result<LedgerPrice, LedgerError>;

    async fn list_prices(
        &self,
        query: PriceQuery,
        page: PageRequest,
    ) -> Result<Page<LedgerPrice>, LedgerError>;

    /// Lists a customer's subscriptions, newest first, schedules expanded.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
        page: PageRequest,
    ) -> Result<Page<LedgerSubscription>, LedgerError>;

    async fn get_schedule(&self, schedule_id: &str) -> Result<LedgerSchedule, LedgerError>;

    async fn create_schedule(
        &self,
        request: CreateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError>;

    /// Attaches a new schedule mirroring a subscription's current state.
    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<LedgerSchedule, LedgerError>;

    async fn update_schedule(
        &self,
        schedule_id: &str,
        request: UpdateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError>;

    /// Ends a subscription immediately.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
        invoice_now: bool,
    ) -> Result<LedgerSubscription, LedgerError>;

    async fn create_usage_record(&self, request: UsageRecordRequest) -> Result<(), LedgerError>;

    /// Aggregated usage of a subscription item in its current period.
    async fn usage_total(&self, subscription_item_id: &str) -> Result<i64, LedgerError>;

    async fn create_test_clock(
        &self,
        name: &str,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError>;

    async fn advance_test_clock(
        &self,
        clock_id: &ClockId,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError>;

    async fn get_test_clock(&self, clock_id: &ClockId) -> Result<LedgerClock, LedgerError>;
}

// ════════════════════════════════════════════════════════════════════════════
// Pagination
// ════════════════════════════════════════════════════════════════════════════

/// Cursor for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub starting_after: Option<String>,
    pub limit: Option<u32>,
}

impl PageRequest {
    pub fn after(id: impl Into<String>) -> Self {
        Self {
            starting_after: Some(id.into()),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

/// Objects that can act as a pagination cursor.
pub trait Listed {
    fn ledger_id(&self) -> &str;
}

/// Follows `has_more` cursors until the list is exhausted.
pub async fn list_all<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, LedgerError>
where
    T: Listed,
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, LedgerError>>,
{
    let mut all = Vec::new();
    let mut request = PageRequest::default();
    loop {
        let page = fetch(request).await?;
        let cursor = page.data.last().map(|item| item.ledger_id().to_string());
        all.extend(page.data);
        match cursor {
            Some(id) if page.has_more => request = PageRequest::after(id),
            _ => return Ok(all),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Customers
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    /// Key under which the provider deduplicates retried creates.
    pub idempotency_key: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Scopes the customer to a simulated clock.
    pub test_clock: Option<ClockId>,
}

/// Fields to change on a customer. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCustomerRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub metadata: HashMap<String, String>,
    pub test_clock: Option<ClockId>,
}

impl Listed for LedgerCustomer {
    fn ledger_id(&self) -> &str {
        &self.id
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Products and prices
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProductRequest {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

/// One tier as the provider stores it. `up_to = None` is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<i64>,
    pub unit_amount_decimal: Option<String>,
    pub flat_amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePriceRequest {
    pub lookup_key: String,
    pub currency: String,
    /// Name of the product created alongside the price.
    pub product_name: String,
    pub interval: Interval,
    /// Metered prices bill reported usage; licensed prices bill a quantity.
    pub metered: bool,
    pub aggregate: Option<Aggregate>,
    /// Per-unit amount; only for non-tiered prices.
    pub unit_amount_decimal: Option<String>,
    pub tiers_mode: Option<TierMode>,
    pub tiers: Vec<PriceTier>,
    pub transform: Option<Divide>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPrice {
    pub id: String,
    pub lookup_key: Option<String>,
    pub product_id: String,
    pub currency: String,
    pub active: bool,
    pub interval: Option<Interval>,
    pub metered: bool,
    pub aggregate: Option<Aggregate>,
    pub unit_amount_decimal: Option<String>,
    pub tiers_mode: Option<TierMode>,
    pub tiers: Vec<PriceTier>,
    pub transform: Option<Divide>,
    pub metadata: HashMap<String, String>,
}

impl Listed for LedgerPrice {
    fn ledger_id(&self) -> &str {
        &self.id
    }
}

/// Filter for price listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceQuery {
    /// At most [`MAX_LOOKUP_KEYS`]; empty means all prices.
    pub lookup_keys: Vec<String>,
}

// ════════════════════════════════════════════════════════════════════════════
// Subscriptions and schedules
// ════════════════════════════════════════════════════════════════════════════

/// Subscription status from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Unknown,
}

impl SubscriptionStatus {
    pub fn from_ledger_str(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Unknown,
        }
    }

    /// Terminal statuses never come back.
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: LedgerPrice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    /// Present when the subscription is managed by a schedule.
    pub schedule: Option<LedgerSchedule>,
    pub items: Vec<SubscriptionItem>,
    pub created: Timestamp,
    pub start_date: Timestamp,
    pub current_period_start: Option<Timestamp>,
    pub current_period_end: Option<Timestamp>,
    pub trial_start: Option<Timestamp>,
    pub trial_end: Option<Timestamp>,
    pub cancel_at: Option<Timestamp>,
    pub canceled_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
}

impl Listed for LedgerSubscription {
    fn ledger_id(&self) -> &str {
        &self.id
    }
}

impl LedgerSubscription {
    /// The item billing `price_id`, if any.
    pub fn item_for_price(&self, price_id: &str) -> Option<&SubscriptionItem> {
        self.items.iter().find(|item| item.price.id == price_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    NotStarted,
    Active,
    Completed,
    Released,
    Canceled,
    Unknown,
}

impl ScheduleStatus {
    pub fn from_ledger_str(s: &str) -> Self {
        match s {
            "not_started" => ScheduleStatus::NotStarted,
            "active" => ScheduleStatus::Active,
            "completed" => ScheduleStatus::Completed,
            "released" => ScheduleStatus::Released,
            "canceled" => ScheduleStatus::Canceled,
            _ => ScheduleStatus::Unknown,
        }
    }

    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            ScheduleStatus::NotStarted => "not_started",
            ScheduleStatus::Active => "active",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Released => "released",
            ScheduleStatus::Canceled => "canceled",
            ScheduleStatus::Unknown => "unknown",
        }
    }

    /// Released, completed and canceled schedules no longer accept updates.
    pub fn is_mutable(&self) -> bool {
        matches!(self, ScheduleStatus::NotStarted | ScheduleStatus::Active)
    }
}

/// What happens to the subscription once the last phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndBehavior {
    /// The subscription continues without a schedule.
    #[default]
    Release,
    Cancel,
}

impl EndBehavior {
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            EndBehavior::Release => "release",
            EndBehavior::Cancel => "cancel",
        }
    }

    pub fn from_ledger_str(s: &str) -> Self {
        match s {
            "cancel" => EndBehavior::Cancel,
            _ => EndBehavior::Release,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPhase {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPhase {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    /// Price ids of the phase items.
    pub prices: Vec<String>,
    pub trial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSchedule {
    pub id: String,
    pub status: ScheduleStatus,
    pub subscription_id: Option<String>,
    pub customer_id: String,
    pub current_phase: Option<CurrentPhase>,
    pub phases: Vec<LedgerPhase>,
    pub end_behavior: EndBehavior,
    pub metadata: HashMap<String, String>,
}

/// One phase in a schedule create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePhaseParams {
    /// Only accepted on updates; creates take the schedule start instead.
    pub start: Option<Effective>,
    /// Required on every phase but the last.
    pub end: Option<Effective>,
    pub prices: Vec<String>,
    pub trial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub customer_id: String,
    pub start: Effective,
    pub phases: Vec<SchedulePhaseParams>,
    pub end_behavior: EndBehavior,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateScheduleRequest {
    pub phases: Vec<SchedulePhaseParams>,
    pub end_behavior: EndBehavior,
    pub prorate: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// Usage and clocks
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecordRequest {
    pub subscription_item_id: String,
    pub quantity: i64,
    pub timestamp: Effective,
    pub action: UsageAction,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockStatus {
    Ready,
    Advancing,
    InternalFailure,
}

impl ClockStatus {
    pub fn from_ledger_str(s: &str) -> Self {
        match s {
            "ready" => ClockStatus::Ready,
            "advancing" => ClockStatus::Advancing,
            _ => ClockStatus::InternalFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerClock {
    pub id: ClockId,
    pub name: String,
    pub frozen_time: Timestamp,
    pub status: ClockStatus,
}

// ════════════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════════════

/// Errors from ledger operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerError {
    pub code: LedgerErrorCode,
    pub message: String,
    /// Request parameter the provider blamed, if any.
    pub param: Option<String>,
    pub http_status: Option<u16>,
    pub retryable: bool,
}

impl LedgerError {
    pub fn new(code: LedgerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            param: None,
            http_status: None,
            retryable: code.is_retryable(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        if status >= 500 {
            self.retryable = true;
        }
        self
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(LedgerErrorCode::NotFound, format!("No such {}", resource))
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorCode::AlreadyExists, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorCode::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorCode::Network, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorCode::Provider, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == LedgerErrorCode::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == LedgerErrorCode::AlreadyExists
    }

    /// Wraps into the engine error with operation and subject context.
    pub fn into_control(self, operation: &'static str, context: impl ToString) -> ControlError {
        ControlError::Ledger {
            operation,
            context: context.to_string(),
            source: Box::new(self),
        }
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(param) = &self.param {
            write!(f, " (param: {})", param)?;
        }
        Ok(())
    }
}

impl std::error::Error for LedgerError {}

/// Ledger error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerErrorCode {
    NotFound,
    AlreadyExists,
    Validation,
    RateLimited,
    Network,
    Provider,
    Unknown,
}

impl LedgerErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerErrorCode::RateLimited | LedgerErrorCode::Network)
    }
}

impl std::fmt::Display for LedgerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LedgerErrorCode::NotFound => "not_found",
            LedgerErrorCode::AlreadyExists => "already_exists",
            LedgerErrorCode::Validation => "validation",
            LedgerErrorCode::RateLimited => "rate_limited",
            LedgerErrorCode::Network => "network",
            LedgerErrorCode::Provider => "provider",
            LedgerErrorCode::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Whether an update failed because the schedule was released in the
/// meantime.
///
/// The provider reports this with a generic error type, so the only signal
/// is the message text. Every other caller goes through this function; if
/// the provider wording changes, released schedules stop being retried.
pub fn is_schedule_released(err: &LedgerError) -> bool {
    err.message.contains("`released` status") || err.message.contains("schedule was released")
}

/// Whether the provider rejected a phase for carrying too many items.
pub fn is_too_many_items(err: &LedgerError) -> bool {
    let msg = err.message.to_ascii_lowercase();
    err.code == LedgerErrorCode::Validation
        && msg.contains("items")
        && (msg.contains("at most") || msg.contains("too many"))
}

/// Whether the error names a customer that no longer exists.
pub fn is_missing_customer(err: &LedgerError) -> bool {
    err.is_not_found()
        && (err.param.as_deref() == Some("customer") || err.message.contains("No such customer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item(String);

    impl Listed for Item {
        fn ledger_id(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn released_predicate_matches_provider_wording() {
        let err = LedgerError::validation(
            "You cannot update a subscription schedule that is currently in the `released` status.",
        );
        assert!(is_schedule_released(&err));
        assert!(!is_schedule_released(&LedgerError::validation("bad phase")));
    }

    #[test]
    fn too_many_items_is_a_validation_error() {
        let err = LedgerError::validation("A phase can have at most 20 items.");
        assert!(is_too_many_items(&err));
        assert!(!is_too_many_items(&LedgerError::provider("at most 20 items")));
    }

    #[test]
    fn missing_customer_by_param_or_message() {
        assert!(is_missing_customer(&LedgerError::not_found("customer: 'cus_1'")));
        assert!(is_missing_customer(
            &LedgerError::new(LedgerErrorCode::NotFound, "gone").with_param("customer")
        ));
        assert!(!is_missing_customer(&LedgerError::not_found("price")));
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(!LedgerError::provider("boom").retryable);
        assert!(LedgerError::provider("boom").with_status(502).retryable);
        assert!(LedgerError::new(LedgerErrorCode::RateLimited, "slow down").retryable);
    }

    #[test]
    fn into_control_keeps_context() {
        let err = LedgerError::not_found("price").into_control("create_schedule", "org:acme");
        assert_eq!(
            err.to_string(),
            "create_schedule failed (org:acme): not_found: No such price"
        );
    }

    #[tokio::test]
    async fn list_all_follows_cursors() {
        let pages = vec![
            Page {
                data: vec![Item("a".into()), Item("b".into())],
                has_more: true,
            },
            Page {
                data: vec![Item("c".into())],
                has_more: false,
            },
        ];
        let mut pages = pages.into_iter();
        let mut cursors = Vec::new();
        let all = list_all(|req: PageRequest| {
            cursors.push(req.starting_after.clone());
            let page = pages.next();
            async move { page.ok_or_else(|| LedgerError::provider("no more pages")) }
        })
        .await
        .unwrap();

        assert_eq!(all.len(), 3);
        assert_eq!(cursors, vec![None, Some("b".to_string())]);
    }
}
