//! In-memory ledger for testing.
//!
//! Implements `LedgerClient` with the provider semantics the engine depends
//! on, without network access:
//! - Idempotent customer creation and usage records
//! - Unique product ids and price lookup keys
//! - Schedules that advance, release or cancel as (simulated) time passes
//! - Simulated clocks that report `advancing` for a few polls
//! - Error injection and call tracking
//!
//! Billing periods never roll over: usage totals cover every record of an
//! item.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::foundation::{ClockId, Timestamp};
use crate::domain::catalog::Aggregate;
use crate::domain::usage::UsageAction;
use crate::ports::{
    ClockStatus, CreateCustomerRequest, CreatePriceRequest, CreateProductRequest,
    CreateScheduleRequest, CurrentPhase, EndBehavior, LedgerClient, LedgerClock, LedgerCustomer,
    LedgerError, LedgerPhase, LedgerPrice, LedgerSchedule, LedgerSubscription, Listed, Page,
    PageRequest, PriceQuery, SchedulePhaseParams, ScheduleStatus, SubscriptionItem,
    SubscriptionStatus, UpdateCustomerRequest, UpdateScheduleRequest, UsageRecordRequest,
    MAX_LOOKUP_KEYS,
};

const MAX_ITEMS_PER_PHASE: usize = 20;
const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_ADVANCE_POLLS: u32 = 2;

/// In-memory ledger for testing.
///
/// Clones share state, so a test can keep a handle for assertions while the
/// engine owns another.
///
/// ```ignore
/// let ledger = InMemoryLedger::new();
/// let control = Control::new(Arc::new(ledger.clone()), EngineConfig::default());
///
/// ledger.fail_next("create_price", LedgerError::network("reset"));
/// // ...
/// assert_eq!(ledger.call_count("create_customer"), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryLedger {
    inner: Arc<Mutex<LedgerState>>,
}

/// Recorded method call for assertions.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub method: String,
    pub args: Vec<String>,
}

struct LedgerState {
    live: bool,
    next_id: u64,
    page_size: usize,
    advance_polls: u32,

    customers: Vec<LedgerCustomer>,
    deleted_customers: HashSet<String>,
    customer_keys: HashMap<String, String>,

    products: HashMap<String, CreateProductRequest>,
    prices: Vec<LedgerPrice>,

    subscriptions: Vec<SubscriptionRecord>,
    schedules: HashMap<String, ScheduleRecord>,
    /// (subscription id, price id) -> subscription item id.
    items: HashMap<(String, String), String>,

    /// Item id -> quantity by Unix timestamp.
    usage: HashMap<String, BTreeMap<i64, i64>>,
    usage_keys: HashSet<String>,

    clocks: HashMap<String, ClockRecord>,

    method_errors: HashMap<String, LedgerError>,
    queued_errors: HashMap<String, VecDeque<LedgerError>>,
    release_before_update: bool,
    call_log: Vec<MethodCall>,

    price_latency: Duration,
    prices_in_flight: usize,
    peak_prices_in_flight: usize,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            live: false,
            next_id: 0,
            page_size: DEFAULT_PAGE_SIZE,
            advance_polls: DEFAULT_ADVANCE_POLLS,
            customers: Vec::new(),
            deleted_customers: HashSet::new(),
            customer_keys: HashMap::new(),
            products: HashMap::new(),
            prices: Vec::new(),
            subscriptions: Vec::new(),
            schedules: HashMap::new(),
            items: HashMap::new(),
            usage: HashMap::new(),
            usage_keys: HashSet::new(),
            clocks: HashMap::new(),
            method_errors: HashMap::new(),
            queued_errors: HashMap::new(),
            release_before_update: false,
            call_log: Vec::new(),
            price_latency: Duration::ZERO,
            prices_in_flight: 0,
            peak_prices_in_flight: 0,
        }
    }
}

struct SubscriptionRecord {
    id: String,
    customer_id: String,
    seq: u64,
    created: Timestamp,
    start_date: Timestamp,
    status: SubscriptionStatus,
    prices: Vec<String>,
    schedule_id: Option<String>,
    current_period_start: Option<Timestamp>,
    current_period_end: Option<Timestamp>,
    trial_start: Option<Timestamp>,
    trial_end: Option<Timestamp>,
    cancel_at: Option<Timestamp>,
    canceled_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
}

struct ScheduleRecord {
    id: String,
    customer_id: String,
    subscription_id: Option<String>,
    status: ScheduleStatus,
    phases: Vec<LedgerPhase>,
    end_behavior: EndBehavior,
    metadata: HashMap<String, String>,
}

struct ClockRecord {
    clock: LedgerClock,
    polls_remaining: u32,
}

fn next_id(counter: &mut u64, prefix: &str) -> String {
    *counter += 1;
    format!("{}_{:06}", prefix, counter)
}

fn missing_customer(id: &str) -> LedgerError {
    LedgerError::not_found(&format!("customer: '{}'", id)).with_param("customer")
}

fn paginate<T: Listed + Clone>(items: &[T], request: &PageRequest, default_size: usize) -> Page<T> {
    let start = match &request.starting_after {
        Some(cursor) => items
            .iter()
            .position(|item| item.ledger_id() == cursor)
            .map(|i| i + 1)
            .unwrap_or(items.len()),
        None => 0,
    };
    let size = request.limit.map(|l| l as usize).unwrap_or(default_size).max(1);
    let end = (start + size).min(items.len());
    Page {
        data: items[start..end].to_vec(),
        has_more: end < items.len(),
    }
}

/// Index of the phase covering `now`.
fn phase_at(phases: &[LedgerPhase], now: Timestamp) -> Option<usize> {
    phases
        .iter()
        .position(|p| p.start <= now && p.end.map_or(true, |end| now < end))
}

impl LedgerState {
    fn now_for(&self, customer_id: &str) -> Timestamp {
        self.customers
            .iter()
            .find(|c| c.id == customer_id)
            .and_then(|c| c.test_clock.as_ref())
            .and_then(|clock| self.clocks.get(clock.as_str()))
            .map(|record| record.clock.frozen_time)
            .unwrap_or_else(Timestamp::now)
    }

    fn customer_exists(&self, id: &str) -> bool {
        !self.deleted_customers.contains(id) && self.customers.iter().any(|c| c.id == id)
    }

    fn price(&self, id: &str) -> Option<&LedgerPrice> {
        self.prices.iter().find(|p| p.id == id)
    }

    /// Moves every subscription and schedule forward to its customer's "now".
    fn settle(&mut self) {
        let nows: Vec<Timestamp> = self
            .subscriptions
            .iter()
            .map(|s| self.now_for(&s.customer_id))
            .collect();

        for (sub, now) in self.subscriptions.iter_mut().zip(nows) {
            if sub.status.is_ended() {
                continue;
            }

            let schedule = match sub.schedule_id.as_ref() {
                Some(id) => self.schedules.get_mut(id),
                None => None,
            };
            let Some(schedule) = schedule else {
                if let Some(cancel_at) = sub.cancel_at.filter(|at| *at <= now) {
                    sub.status = SubscriptionStatus::Canceled;
                    sub.canceled_at = Some(cancel_at);
                    sub.ended_at = Some(cancel_at);
                }
                continue;
            };

            if !schedule.status.is_mutable() || schedule.phases.is_empty() {
                continue;
            }

            let last_end = schedule.phases.last().and_then(|p| p.end);
            if let Some(end) = last_end.filter(|end| *end <= now) {
                match schedule.end_behavior {
                    EndBehavior::Cancel => {
                        schedule.status = ScheduleStatus::Completed;
                        sub.status = SubscriptionStatus::Canceled;
                        sub.canceled_at = Some(end);
                        sub.ended_at = Some(end);
                    }
                    EndBehavior::Release => {
                        schedule.status = ScheduleStatus::Released;
                        if let Some(last) = schedule.phases.last() {
                            sub.prices = last.prices.clone();
                            sub.current_period_start = Some(end);
                            sub.current_period_end = None;
                        }
                        sub.schedule_id = None;
                    }
                }
                continue;
            }

            let Some(i) = phase_at(&schedule.phases, now) else {
                schedule.status = ScheduleStatus::NotStarted;
                if let Some(first) = schedule.phases.first() {
                    sub.prices = first.prices.clone();
                }
                continue;
            };

            let phase = &schedule.phases[i];
            schedule.status = ScheduleStatus::Active;
            sub.prices = phase.prices.clone();
            sub.current_period_start = Some(phase.start);
            sub.current_period_end = phase.end;
            if phase.trial {
                sub.status = SubscriptionStatus::Trialing;
                sub.trial_start = Some(phase.start);
                sub.trial_end = phase.end;
            } else {
                sub.status = SubscriptionStatus::Active;
            }
        }

        for sub in &self.subscriptions {
            for price in &sub.prices {
                self.items
                    .entry((sub.id.clone(), price.clone()))
                    .or_insert_with(|| next_id(&mut self.next_id, "si"));
            }
        }
    }

    fn build_phases(
        &self,
        params: &[SchedulePhaseParams],
        first_start: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<LedgerPhase>, LedgerError> {
        if params.is_empty() {
            return Err(LedgerError::validation("At least one phase is required.").with_param("phases"));
        }
        let last = params.len() - 1;
        let mut start = first_start;
        let mut phases = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            if let Some(s) = p.start {
                start = s.resolve(now);
            }
            if p.prices.len() > MAX_ITEMS_PER_PHASE {
                return Err(LedgerError::validation(format!(
                    "A phase can have at most {} items.",
                    MAX_ITEMS_PER_PHASE
                ))
                .with_param(format!("phases[{}][items]", i)));
            }
            if let Some(missing) = p.prices.iter().find(|id| self.price(id).is_none()) {
                return Err(LedgerError::not_found(&format!("price: '{}'", missing))
                    .with_param(format!("phases[{}][items]", i)));
            }
            let end = p.end.map(|e| e.resolve(now));
            match end {
                None if i < last => {
                    return Err(LedgerError::validation("Every phase but the last needs an end_date.")
                        .with_param(format!("phases[{}][end_date]", i)));
                }
                Some(end) if end <= start => {
                    return Err(LedgerError::validation("Phase end_date must be after its start_date.")
                        .with_param(format!("phases[{}][end_date]", i)));
                }
                _ => {}
            }
            phases.push(LedgerPhase {
                start,
                end,
                prices: p.prices.clone(),
                trial: p.trial,
            });
            if let Some(end) = end {
                start = end;
            }
        }
        Ok(phases)
    }

    fn schedule_view(&self, record: &ScheduleRecord) -> LedgerSchedule {
        let now = self.now_for(&record.customer_id);
        let current_phase = if record.status == ScheduleStatus::Active {
            phase_at(&record.phases, now).map(|i| CurrentPhase {
                start: record.phases[i].start,
                end: record.phases[i].end,
            })
        } else {
            None
        };
        LedgerSchedule {
            id: record.id.clone(),
            status: record.status,
            subscription_id: record.subscription_id.clone(),
            customer_id: record.customer_id.clone(),
            current_phase,
            phases: record.phases.clone(),
            end_behavior: record.end_behavior,
            metadata: record.metadata.clone(),
        }
    }

    fn subscription_view(&self, record: &SubscriptionRecord) -> LedgerSubscription {
        let items = record
            .prices
            .iter()
            .filter_map(|price_id| {
                let price = self.price(price_id)?.clone();
                let id = self.items.get(&(record.id.clone(), price_id.clone()))?.clone();
                Some(SubscriptionItem { id, price })
            })
            .collect();
        let schedule = record
            .schedule_id
            .as_ref()
            .and_then(|id| self.schedules.get(id))
            .map(|s| self.schedule_view(s));
        LedgerSubscription {
            id: record.id.clone(),
            customer_id: record.customer_id.clone(),
            status: record.status,
            schedule,
            items,
            created: record.created,
            start_date: record.start_date,
            current_period_start: record.current_period_start,
            current_period_end: record.current_period_end,
            trial_start: record.trial_start,
            trial_end: record.trial_end,
            cancel_at: record.cancel_at,
            canceled_at: record.canceled_at,
            ended_at: record.ended_at,
        }
    }

    fn release(&mut self, schedule_id: &str) {
        if let Some(schedule) = self.schedules.get_mut(schedule_id) {
            schedule.status = ScheduleStatus::Released;
            if let Some(sub) = self
                .subscriptions
                .iter_mut()
                .find(|s| s.schedule_id.as_deref() == Some(schedule_id))
            {
                sub.schedule_id = None;
            }
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// A test-mode ledger.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    /// A ledger that reports itself as live.
    pub fn live() -> Self {
        let ledger = Self::new();
        ledger.state().live = true;
        ledger
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Configuration Methods
    // ════════════════════════════════════════════════════════════════════════════

    /// Page size for list calls without an explicit limit.
    pub fn set_page_size(&self, size: usize) {
        self.state().page_size = size.max(1);
    }

    /// Polls a clock reports `advancing` after each advance.
    pub fn set_advance_polls(&self, polls: u32) {
        self.state().advance_polls = polls;
    }

    /// Fail every call to `method` until cleared.
    pub fn set_method_error(&self, method: &str, error: LedgerError) {
        self.state().method_errors.insert(method.to_string(), error);
    }

    /// Fail the next call to `method` once. Queued errors fire in order.
    pub fn fail_next(&self, method: &str, error: LedgerError) {
        self.state()
            .queued_errors
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    /// Delay every `create_price` call by `latency`.
    pub fn set_price_latency(&self, latency: Duration) {
        self.state().price_latency = latency;
    }

    pub fn clear_errors(&self) {
        let mut state = self.state();
        state.method_errors.clear();
        state.queued_errors.clear();
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Simulated Races
    // ════════════════════════════════════════════════════════════════════════════

    /// Releases a schedule as if it ran past its last phase.
    pub fn release_schedule(&self, schedule_id: &str) {
        self.state().release(schedule_id);
    }

    /// Releases the target schedule right before the next update reaches it.
    pub fn release_schedule_before_next_update(&self) {
        self.state().release_before_update = true;
    }

    /// Deletes a customer behind the engine's back.
    pub fn delete_customer(&self, customer_id: &str) {
        self.state().deleted_customers.insert(customer_id.to_string());
    }

    /// Makes a clock report `internal_failure`.
    pub fn fail_clock(&self, clock_id: &ClockId) {
        if let Some(record) = self.state().clocks.get_mut(clock_id.as_str()) {
            record.clock.status = ClockStatus::InternalFailure;
            record.polls_remaining = 0;
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Inspection
    // ════════════════════════════════════════════════════════════════════════════

    pub fn customers_tagged(&self, key: &str, value: &str) -> Vec<LedgerCustomer> {
        let state = self.state();
        let customers = state
            .customers
            .iter()
            .filter(|c| !state.deleted_customers.contains(&c.id))
            .filter(|c| c.metadata.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect();
        customers
    }

    /// Most `create_price` calls seen in flight at once.
    pub fn peak_concurrent_prices(&self) -> usize {
        self.state().peak_prices_in_flight
    }

    pub fn price_count(&self) -> usize {
        self.state().prices.len()
    }

    pub fn has_product(&self, product_id: &str) -> bool {
        self.state().products.contains_key(product_id)
    }

    pub fn subscriptions_of(&self, customer_id: &str) -> Vec<LedgerSubscription> {
        let mut state = self.state();
        state.settle();
        let subscriptions = state
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == customer_id)
            .map(|s| state.subscription_view(s))
            .collect();
        subscriptions
    }

    pub fn schedule(&self, schedule_id: &str) -> Option<LedgerSchedule> {
        let mut state = self.state();
        state.settle();
        let schedule = state.schedules.get(schedule_id).map(|s| state.schedule_view(s));
        schedule
    }

    /// Recorded (timestamp, quantity) pairs of an item.
    pub fn usage_records(&self, item_id: &str) -> Vec<(i64, i64)> {
        self.state()
            .usage
            .get(item_id)
            .map(|records| records.iter().map(|(t, q)| (*t, *q)).collect())
            .unwrap_or_default()
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Call Tracking
    // ════════════════════════════════════════════════════════════════════════════

    pub fn calls(&self) -> Vec<MethodCall> {
        self.state().call_log.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .call_log
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().call_log.clear();
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Internal Helpers
    // ════════════════════════════════════════════════════════════════════════════

    /// Records the call and returns the injected error for `method`, if any.
    fn enter(&self, method: &str, args: Vec<String>) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        let mut state = self.state();
        state.call_log.push(MethodCall {
            method: method.to_string(),
            args,
        });
        if let Some(error) = state
            .queued_errors
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = state.method_errors.get(method) {
            return Err(error.clone());
        }
        state.settle();
        Ok(state)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn is_live(&self) -> bool {
        self.state().live
    }

    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError> {
        let mut state = self.enter(
            "create_customer",
            vec![request.idempotency_key.clone().unwrap_or_default()],
        )?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = state.customer_keys.get(key) {
                let existing = existing.clone();
                return state
                    .customers
                    .iter()
                    .find(|c| c.id == existing)
                    .cloned()
                    .ok_or_else(|| missing_customer(&existing));
            }
        }
        if let Some(clock) = &request.test_clock {
            if !state.clocks.contains_key(clock.as_str()) {
                return Err(LedgerError::not_found(&format!("test_clock: '{}'", clock))
                    .with_param("test_clock"));
            }
        }

        let customer = LedgerCustomer {
            id: next_id(&mut state.next_id, "cus"),
            email: request.email,
            name: request.name,
            description: request.description,
            phone: request.phone,
            metadata: request.metadata,
            test_clock: request.test_clock,
        };
        if let Some(key) = request.idempotency_key {
            state.customer_keys.insert(key, customer.id.clone());
        }
        state.customers.push(customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: &str) -> Result<LedgerCustomer, LedgerError> {
        let state = self.enter("get_customer", vec![customer_id.to_string()])?;
        if !state.customer_exists(customer_id) {
            return Err(missing_customer(customer_id));
        }
        state
            .customers
            .iter()
            .find(|c| c.id == customer_id)
            .cloned()
            .ok_or_else(|| missing_customer(customer_id))
    }

    async fn list_customers(&self, page: PageRequest) -> Result<Page<LedgerCustomer>, LedgerError> {
        let state = self.enter("list_customers", vec![])?;
        let newest_first: Vec<LedgerCustomer> = state
            .customers
            .iter()
            .rev()
            .filter(|c| !state.deleted_customers.contains(&c.id))
            .cloned()
            .collect();
        Ok(paginate(&newest_first, &page, state.page_size))
    }

    async fn update_customer(
        &self,
        customer_id: &str,
        request: UpdateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError> {
        let mut state = self.enter("update_customer", vec![customer_id.to_string()])?;
        if !state.customer_exists(customer_id) {
            return Err(missing_customer(customer_id));
        }
        let customer = state
            .customers
            .iter_mut()
            .find(|c| c.id == customer_id)
            .ok_or_else(|| missing_customer(customer_id))?;
        if request.email.is_some() {
            customer.email = request.email;
        }
        if request.name.is_some() {
            customer.name = request.name;
        }
        if request.description.is_some() {
            customer.description = request.description;
        }
        if request.phone.is_some() {
            customer.phone = request.phone;
        }
        customer.metadata.extend(request.metadata);
        Ok(customer.clone())
    }

    async fn create_product(&self, request: CreateProductRequest) -> Result<String, LedgerError> {
        let mut state = self.enter("create_product", vec![request.id.clone()])?;
        if state.products.contains_key(&request.id) {
            return Err(LedgerError::already_exists("Product already exists.").with_param("id"));
        }
        let id = request.id.clone();
        state.products.insert(id.clone(), request);
        Ok(id)
    }

    async fn create_price(&self, request: CreatePriceRequest) -> Result<LedgerPrice, LedgerError> {
        let latency = {
            let mut state = self.state();
            state.prices_in_flight += 1;
            state.peak_prices_in_flight = state.peak_prices_in_flight.max(state.prices_in_flight);
            state.price_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state().prices_in_flight -= 1;

        let mut state = self.enter("create_price", vec![request.lookup_key.clone()])?;

        if let Some(existing) = state
            .prices
            .iter()
            .find(|p| p.lookup_key.as_deref() == Some(request.lookup_key.as_str()))
        {
            return Err(LedgerError::already_exists(format!(
                "A price (`{}`) already uses that lookup key.",
                existing.id
            ))
            .with_param("lookup_key"));
        }
        if request.metered && request.aggregate.is_none() {
            return Err(LedgerError::validation("Metered prices need an aggregate_usage.")
                .with_param("recurring[aggregate_usage]"));
        }
        if !request.tiers.is_empty() && request.tiers_mode.is_none() {
            return Err(LedgerError::validation("Tiered prices need a tiers_mode.")
                .with_param("tiers_mode"));
        }

        let product_id = next_id(&mut state.next_id, "prod");
        state.products.insert(
            product_id.clone(),
            CreateProductRequest {
                id: product_id.clone(),
                name: request.product_name.clone(),
                active: true,
                metadata: HashMap::new(),
            },
        );

        let price = LedgerPrice {
            id: next_id(&mut state.next_id, "price"),
            lookup_key: Some(request.lookup_key),
            product_id,
            currency: request.currency.to_ascii_lowercase(),
            active: true,
            interval: Some(request.interval),
            metered: request.metered,
            aggregate: request.aggregate,
            unit_amount_decimal: request.unit_amount_decimal,
            tiers_mode: request.tiers_mode,
            tiers: request.tiers,
            transform: request.transform,
            metadata: request.metadata,
        };
        state.prices.push(price.clone());
        Ok(price)
    }

    async fn list_prices(
        &self,
        query: PriceQuery,
        page: PageRequest,
    ) -> Result<Page<LedgerPrice>, LedgerError> {
        let state = self.enter("list_prices", query.lookup_keys.clone())?;
        if query.lookup_keys.len() > MAX_LOOKUP_KEYS {
            return Err(LedgerError::validation(format!(
                "At most {} lookup keys may be given.",
                MAX_LOOKUP_KEYS
            ))
            .with_param("lookup_keys"));
        }
        let matching: Vec<LedgerPrice> = state
            .prices
            .iter()
            .filter(|p| p.active)
            .filter(|p| {
                query.lookup_keys.is_empty()
                    || p.lookup_key
                        .as_ref()
                        .map_or(false, |key| query.lookup_keys.contains(key))
            })
            .cloned()
            .collect();
        Ok(paginate(&matching, &page, state.page_size))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        page: PageRequest,
    ) -> Result<Page<LedgerSubscription>, LedgerError> {
        let state = self.enter("list_subscriptions", vec![customer_id.to_string()])?;
        let mut records: Vec<&SubscriptionRecord> = state
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == customer_id)
            .collect();
        records.sort_by(|a, b| b.seq.cmp(&a.seq));
        let views: Vec<LedgerSubscription> =
            records.into_iter().map(|s| state.subscription_view(s)).collect();
        Ok(paginate(&views, &page, state.page_size))
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<LedgerSchedule, LedgerError> {
        let state = self.enter("get_schedule", vec![schedule_id.to_string()])?;
        state
            .schedules
            .get(schedule_id)
            .map(|s| state.schedule_view(s))
            .ok_or_else(|| LedgerError::not_found(&format!("subscription_schedule: '{}'", schedule_id)))
    }

    async fn create_schedule(
        &self,
        request: CreateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut state = self.enter("create_schedule", vec![request.customer_id.clone()])?;
        if !state.customer_exists(&request.customer_id) {
            return Err(missing_customer(&request.customer_id));
        }
        let now = state.now_for(&request.customer_id);
        let start = request.start.resolve(now);
        let phases = state.build_phases(&request.phases, start, now)?;

        let subscription_id = next_id(&mut state.next_id, "sub");
        let schedule_id = next_id(&mut state.next_id, "sub_sched");
        let seq = state.next_id;
        let first_prices = phases.first().map(|p| p.prices.clone()).unwrap_or_default();

        state.schedules.insert(
            schedule_id.clone(),
            ScheduleRecord {
                id: schedule_id.clone(),
                customer_id: request.customer_id.clone(),
                subscription_id: Some(subscription_id.clone()),
                status: ScheduleStatus::NotStarted,
                phases,
                end_behavior: request.end_behavior,
                metadata: request.metadata,
            },
        );
        state.subscriptions.push(SubscriptionRecord {
            id: subscription_id,
            customer_id: request.customer_id,
            seq,
            created: now,
            start_date: start,
            status: SubscriptionStatus::Active,
            prices: first_prices,
            schedule_id: Some(schedule_id.clone()),
            current_period_start: Some(start),
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            cancel_at: None,
            canceled_at: None,
            ended_at: None,
        });
        state.settle();

        state
            .schedules
            .get(&schedule_id)
            .map(|s| state.schedule_view(s))
            .ok_or_else(|| LedgerError::provider("schedule vanished after create"))
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut state = self.enter(
            "create_schedule_from_subscription",
            vec![subscription_id.to_string()],
        )?;
        let schedule_id = next_id(&mut state.next_id, "sub_sched");

        let sub = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| LedgerError::not_found(&format!("subscription: '{}'", subscription_id)))?;
        if sub.status.is_ended() {
            return Err(LedgerError::validation(
                "You cannot migrate a canceled subscription to a schedule.",
            ));
        }
        if sub.schedule_id.is_some() {
            return Err(LedgerError::validation(
                "You cannot migrate a subscription that is already attached to a schedule.",
            )
            .with_param("from_subscription"));
        }
        sub.schedule_id = Some(schedule_id.clone());
        let record = ScheduleRecord {
            id: schedule_id.clone(),
            customer_id: sub.customer_id.clone(),
            subscription_id: Some(sub.id.clone()),
            status: ScheduleStatus::Active,
            phases: vec![LedgerPhase {
                start: sub.current_period_start.unwrap_or(sub.start_date),
                end: None,
                prices: sub.prices.clone(),
                trial: false,
            }],
            end_behavior: EndBehavior::Release,
            metadata: HashMap::new(),
        };
        state.schedules.insert(schedule_id.clone(), record);
        state.settle();

        state
            .schedules
            .get(&schedule_id)
            .map(|s| state.schedule_view(s))
            .ok_or_else(|| LedgerError::provider("schedule vanished after create"))
    }

    async fn update_schedule(
        &self,
        schedule_id: &str,
        request: UpdateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut state = self.enter("update_schedule", vec![schedule_id.to_string()])?;
        if std::mem::take(&mut state.release_before_update) {
            state.release(schedule_id);
        }

        let (status, customer_id, first_start) = {
            let schedule = state.schedules.get(schedule_id).ok_or_else(|| {
                LedgerError::not_found(&format!("subscription_schedule: '{}'", schedule_id))
            })?;
            (
                schedule.status,
                schedule.customer_id.clone(),
                schedule.phases.first().map(|p| p.start),
            )
        };
        if !status.is_mutable() {
            return Err(LedgerError::validation(format!(
                "You cannot update a subscription schedule that is currently in the `{}` status.",
                status.as_ledger_str()
            )));
        }

        let now = state.now_for(&customer_id);
        let phases = state.build_phases(&request.phases, first_start.unwrap_or(now), now)?;
        if let Some(schedule) = state.schedules.get_mut(schedule_id) {
            schedule.phases = phases;
            schedule.end_behavior = request.end_behavior;
        }
        state.settle();

        state
            .schedules
            .get(schedule_id)
            .map(|s| state.schedule_view(s))
            .ok_or_else(|| LedgerError::provider("schedule vanished after update"))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
        invoice_now: bool,
    ) -> Result<LedgerSubscription, LedgerError> {
        let mut state = self.enter(
            "cancel_subscription",
            vec![
                subscription_id.to_string(),
                prorate.to_string(),
                invoice_now.to_string(),
            ],
        )?;
        let customer_id = state
            .subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .map(|s| s.customer_id.clone())
            .ok_or_else(|| LedgerError::not_found(&format!("subscription: '{}'", subscription_id)))?;
        let now = state.now_for(&customer_id);

        let mut schedule_id = None;
        if let Some(sub) = state.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
            if sub.status.is_ended() {
                return Err(LedgerError::validation("This subscription is already canceled."));
            }
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
            sub.ended_at = Some(now);
            schedule_id = sub.schedule_id.clone();
        }
        if let Some(id) = schedule_id {
            if let Some(schedule) = state.schedules.get_mut(&id) {
                schedule.status = ScheduleStatus::Canceled;
            }
        }

        state
            .subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .map(|s| state.subscription_view(s))
            .ok_or_else(|| LedgerError::not_found(&format!("subscription: '{}'", subscription_id)))
    }

    async fn create_usage_record(&self, request: UsageRecordRequest) -> Result<(), LedgerError> {
        let mut state = self.enter(
            "create_usage_record",
            vec![
                request.subscription_item_id.clone(),
                request.quantity.to_string(),
                request.idempotency_key.clone(),
            ],
        )?;
        if state.usage_keys.contains(&request.idempotency_key) {
            return Ok(());
        }

        let (sub_id, price_id) = state
            .items
            .iter()
            .find(|(_, item)| **item == request.subscription_item_id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| {
                LedgerError::not_found(&format!(
                    "subscription_item: '{}'",
                    request.subscription_item_id
                ))
                .with_param("subscription_item")
            })?;
        let sub = state
            .subscriptions
            .iter()
            .find(|s| s.id == sub_id)
            .ok_or_else(|| LedgerError::not_found(&format!("subscription: '{}'", sub_id)))?;
        if sub.status.is_ended() {
            return Err(LedgerError::validation(
                "Usage records cannot be created on a canceled subscription.",
            ));
        }
        if !state.price(&price_id).map_or(false, |p| p.metered) {
            return Err(LedgerError::validation(
                "Usage records can only be created for metered prices.",
            )
            .with_param("subscription_item"));
        }

        let now = state.now_for(&sub.customer_id);
        let at = request.timestamp.resolve(now).as_unix();
        let records = state.usage.entry(request.subscription_item_id).or_default();
        match request.action {
            UsageAction::Increment => *records.entry(at).or_insert(0) += request.quantity,
            UsageAction::Set => {
                records.insert(at, request.quantity);
            }
        }
        state.usage_keys.insert(request.idempotency_key);
        Ok(())
    }

    async fn usage_total(&self, subscription_item_id: &str) -> Result<i64, LedgerError> {
        let state = self.enter("usage_total", vec![subscription_item_id.to_string()])?;
        let price_id = state
            .items
            .iter()
            .find(|(_, item)| item.as_str() == subscription_item_id)
            .map(|((_, price), _)| price.clone())
            .ok_or_else(|| {
                LedgerError::not_found(&format!("subscription_item: '{}'", subscription_item_id))
            })?;
        let aggregate = state.price(&price_id).and_then(|p| p.aggregate);
        let records = state.usage.get(subscription_item_id);
        let total = match (aggregate, records) {
            (_, None) => 0,
            (Some(Aggregate::Max), Some(r)) => r.values().copied().max().unwrap_or(0),
            (Some(Aggregate::Last | Aggregate::Perpetual), Some(r)) => {
                r.values().next_back().copied().unwrap_or(0)
            }
            (_, Some(r)) => r.values().sum(),
        };
        Ok(total)
    }

    async fn create_test_clock(
        &self,
        name: &str,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError> {
        let mut state = self.enter("create_test_clock", vec![name.to_string()])?;
        let clock = LedgerClock {
            id: ClockId::new(next_id(&mut state.next_id, "clock")),
            name: name.to_string(),
            frozen_time,
            status: ClockStatus::Ready,
        };
        state.clocks.insert(
            clock.id.as_str().to_string(),
            ClockRecord {
                clock: clock.clone(),
                polls_remaining: 0,
            },
        );
        Ok(clock)
    }

    async fn advance_test_clock(
        &self,
        clock_id: &ClockId,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError> {
        let mut state = self.enter(
            "advance_test_clock",
            vec![clock_id.to_string(), frozen_time.to_string()],
        )?;
        let polls = state.advance_polls;
        let record = state
            .clocks
            .get_mut(clock_id.as_str())
            .ok_or_else(|| LedgerError::not_found(&format!("test_clock: '{}'", clock_id)))?;
        if record.clock.status != ClockStatus::Ready {
            return Err(LedgerError::validation("The test clock is not ready to advance."));
        }
        if frozen_time <= record.clock.frozen_time {
            return Err(LedgerError::validation(
                "The test clock can only be advanced forward in time.",
            )
            .with_param("frozen_time"));
        }
        record.clock.frozen_time = frozen_time;
        record.polls_remaining = polls;
        record.clock.status = if polls > 0 {
            ClockStatus::Advancing
        } else {
            ClockStatus::Ready
        };
        let clock = record.clock.clone();
        state.settle();
        Ok(clock)
    }

    async fn get_test_clock(&self, clock_id: &ClockId) -> Result<LedgerClock, LedgerError> {
        let mut state = self.enter("get_test_clock", vec![clock_id.to_string()])?;
        let record = state
            .clocks
            .get_mut(clock_id.as_str())
            .ok_or_else(|| LedgerError::not_found(&format!("test_clock: '{}'", clock_id)))?;
        if record.clock.status == ClockStatus::Advancing {
            record.polls_remaining = record.polls_remaining.saturating_sub(1);
            if record.polls_remaining == 0 {
                record.clock.status = ClockStatus::Ready;
                return Ok(LedgerClock {
                    status: ClockStatus::Advancing,
                    ..record.clock.clone()
                });
            }
        }
        Ok(record.clock.clone())
    }
}
