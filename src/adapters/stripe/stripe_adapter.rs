//! Stripe ledger adapter.
//!
//! Implements the `LedgerClient` trait against the Stripe REST API.
//! Requests are form-encoded; responses are parsed through `wire_types`.
//!
//! # Security
//!
//! - The API key is held in a `secrecy::SecretString` and only exposed to
//!   build the basic-auth header
//! - Keys are never logged; request logs carry method, path and status only
//!
//! # Configuration
//!
//! ```ignore
//! let config = StripeConfig::new(api_key).with_account("acct_123");
//! let adapter = StripeLedgerAdapter::new(config);
//! ```

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::domain::foundation::{ClockId, Effective, Timestamp};
use crate::ports::{
    CreateCustomerRequest, CreatePriceRequest, CreateProductRequest, CreateScheduleRequest,
    LedgerClient, LedgerClock, LedgerCustomer, LedgerError, LedgerPrice, LedgerSchedule,
    LedgerSubscription, Page, PageRequest, PriceQuery, SchedulePhaseParams,
    UpdateCustomerRequest, UpdateScheduleRequest, UsageRecordRequest, MAX_LOOKUP_KEYS,
};

use super::wire_types::{
    StripeCustomer, StripeErrorBody, StripeList, StripePrice, StripeProduct, StripeSchedule,
    StripeSubscription, StripeTestClock, StripeUsageSummary,
};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com";

/// Stripe API configuration.
#[derive(Clone)]
pub struct StripeConfig {
    /// Secret or restricted key (sk_live_..., sk_test_..., rk_...).
    api_key: SecretString,

    /// Base URL for Stripe API (default: https://api.stripe.com).
    api_base_url: String,

    /// Connected account to act on behalf of (`Stripe-Account` header).
    account: Option<String>,

    /// Pinned API version (`Stripe-Version` header).
    api_version: Option<String>,
}

impl StripeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::new(api_key.into()),
            api_base_url: DEFAULT_BASE_URL.to_string(),
            account: None,
            api_version: None,
        }
    }

    /// Set a custom API base URL (for testing).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Live keys carry a `_live_` segment.
    pub fn is_live(&self) -> bool {
        self.api_key.expose_secret().contains("_live_")
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("api_key", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("account", &self.account)
            .field("api_version", &self.api_version)
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Form Encoding
// ════════════════════════════════════════════════════════════════════════════════

/// Stripe's bracketed form parameters, in insertion order.
#[derive(Debug, Default, Clone, PartialEq)]
struct Form(Vec<(String, String)>);

impl Form {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.push((key.into(), value.to_string()));
        self
    }

    fn push_opt(&mut self, key: &str, value: Option<impl ToString>) -> &mut Self {
        if let Some(value) = value {
            self.push(key, value);
        }
        self
    }

    fn metadata(&mut self, prefix: &str, metadata: &HashMap<String, String>) -> &mut Self {
        let mut keys: Vec<&String> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            self.push(format!("{}[{}]", prefix, key), &metadata[key]);
        }
        self
    }

    fn page(&mut self, page: &PageRequest) -> &mut Self {
        self.push_opt("limit", page.limit);
        self.push_opt("starting_after", page.starting_after.as_deref());
        self
    }

    fn pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

fn effective_param(at: &Effective) -> String {
    match at {
        Effective::Immediate => "now".to_string(),
        Effective::At(ts) => ts.as_unix().to_string(),
    }
}

fn phase_params(form: &mut Form, phases: &[SchedulePhaseParams]) {
    for (i, phase) in phases.iter().enumerate() {
        if let Some(start) = &phase.start {
            form.push(format!("phases[{}][start_date]", i), effective_param(start));
        }
        if let Some(end) = &phase.end {
            form.push(format!("phases[{}][end_date]", i), effective_param(end));
        }
        for (j, price) in phase.prices.iter().enumerate() {
            form.push(format!("phases[{}][items][{}][price]", i, j), price);
        }
        if phase.trial {
            form.push(format!("phases[{}][trial]", i), "true");
        }
    }
}

fn customer_fields(
    form: &mut Form,
    email: &Option<String>,
    name: &Option<String>,
    description: &Option<String>,
    phone: &Option<String>,
    metadata: &HashMap<String, String>,
) {
    form.push_opt("email", email.as_deref())
        .push_opt("name", name.as_deref())
        .push_opt("description", description.as_deref())
        .push_opt("phone", phone.as_deref())
        .metadata("metadata", metadata);
}

fn price_form(request: &CreatePriceRequest) -> Form {
    let mut form = Form::new();
    form.push("lookup_key", &request.lookup_key)
        .push("currency", &request.currency)
        .push("product_data[name]", &request.product_name)
        .push("recurring[interval]", request.interval.as_ledger_str())
        .push(
            "recurring[usage_type]",
            if request.metered { "metered" } else { "licensed" },
        )
        .push_opt(
            "recurring[aggregate_usage]",
            request.aggregate.map(|a| a.as_ledger_str()),
        );

    match request.tiers_mode {
        Some(mode) if !request.tiers.is_empty() => {
            form.push("billing_scheme", "tiered")
                .push("tiers_mode", mode.as_ledger_str())
                .push("expand[]", "tiers");
            for (i, tier) in request.tiers.iter().enumerate() {
                let up_to = tier.up_to.map_or_else(|| "inf".to_string(), |n| n.to_string());
                form.push(format!("tiers[{}][up_to]", i), up_to)
                    .push_opt(
                        &format!("tiers[{}][unit_amount_decimal]", i),
                        tier.unit_amount_decimal.as_deref(),
                    )
                    .push_opt(&format!("tiers[{}][flat_amount]", i), tier.flat_amount);
            }
        }
        _ => {
            form.push_opt("unit_amount_decimal", request.unit_amount_decimal.as_deref());
        }
    }

    if let Some(divide) = &request.transform {
        form.push("transform_quantity[divide_by]", divide.by)
            .push("transform_quantity[round]", divide.rounding.as_ledger_str());
    }
    form.metadata("metadata", &request.metadata);
    form
}

// ════════════════════════════════════════════════════════════════════════════════
// Adapter
// ════════════════════════════════════════════════════════════════════════════════

/// Stripe ledger adapter.
///
/// Implements `LedgerClient` for the Stripe API.
pub struct StripeLedgerAdapter {
    config: StripeConfig,
    http_client: reqwest::Client,
}

impl StripeLedgerAdapter {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_client(config: StripeConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    /// Sends one request and parses the JSON body.
    ///
    /// GET parameters go in the query string, everything else in the body.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &Form,
        idempotency_key: Option<&str>,
    ) -> Result<T, LedgerError> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .basic_auth(self.config.api_key.expose_secret(), Option::<&str>::None);

        request = if method == Method::GET {
            request.query(form.pairs())
        } else {
            request.form(form.pairs())
        };
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        if let Some(account) = &self.config.account {
            request = request.header("Stripe-Account", account);
        }
        if let Some(version) = &self.config.api_version {
            request = request.header("Stripe-Version", version);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(method = %method, path, error = %e, "Stripe request failed");
            LedgerError::network(e.to_string())
        })?;

        let status = response.status();
        tracing::debug!(method = %method, path, status = status.as_u16(), "Stripe response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = match serde_json::from_str::<StripeErrorBody>(&body) {
                Ok(parsed) => parsed.error.into_ledger_error(status.as_u16()),
                Err(_) => LedgerError::provider(format!("Stripe API error: {}", body))
                    .with_status(status.as_u16()),
            };
            if err.retryable {
                tracing::warn!(method = %method, path, error = %err, "Stripe call retryable failure");
            }
            return Err(err);
        }

        response.json().await.map_err(|e| {
            LedgerError::provider(format!("Failed to parse Stripe response: {}", e))
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, form: &Form) -> Result<T, LedgerError> {
        self.call(Method::GET, path, form, None).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &Form,
        idempotency_key: Option<&str>,
    ) -> Result<T, LedgerError> {
        self.call(Method::POST, path, form, idempotency_key).await
    }
}

#[async_trait]
impl LedgerClient for StripeLedgerAdapter {
    fn is_live(&self) -> bool {
        self.config.is_live()
    }

    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError> {
        let mut form = Form::new();
        customer_fields(
            &mut form,
            &request.email,
            &request.name,
            &request.description,
            &request.phone,
            &request.metadata,
        );
        form.push_opt("test_clock", request.test_clock.as_ref());

        let customer: StripeCustomer = self
            .post("/v1/customers", &form, request.idempotency_key.as_deref())
            .await?;
        Ok(customer.into())
    }

    async fn get_customer(&self, customer_id: &str) -> Result<LedgerCustomer, LedgerError> {
        let customer: StripeCustomer = self
            .get(&format!("/v1/customers/{}", customer_id), &Form::new())
            .await?;
        if customer.deleted {
            return Err(LedgerError::not_found(&format!("customer: '{}'", customer_id))
                .with_param("customer"));
        }
        Ok(customer.into())
    }

    async fn list_customers(&self, page: PageRequest) -> Result<Page<LedgerCustomer>, LedgerError> {
        let mut form = Form::new();
        form.page(&page);
        let list: StripeList<StripeCustomer> = self.get("/v1/customers", &form).await?;
        list.try_into_page(|c| Ok(c.into()))
    }

    async fn update_customer(
        &self,
        customer_id: &str,
        request: UpdateCustomerRequest,
    ) -> Result<LedgerCustomer, LedgerError> {
        let mut form = Form::new();
        customer_fields(
            &mut form,
            &request.email,
            &request.name,
            &request.description,
            &request.phone,
            &request.metadata,
        );
        let customer: StripeCustomer = self
            .post(&format!("/v1/customers/{}", customer_id), &form, None)
            .await?;
        Ok(customer.into())
    }

    async fn create_product(&self, request: CreateProductRequest) -> Result<String, LedgerError> {
        let mut form = Form::new();
        form.push("id", &request.id)
            .push("name", &request.name)
            .push("active", request.active)
            .metadata("metadata", &request.metadata);
        let product: StripeProduct = self.post("/v1/products", &form, None).await?;
        Ok(product.id)
    }

    async fn create_price(&self, request: CreatePriceRequest) -> Result<LedgerPrice, LedgerError> {
        let form = price_form(&request);
        let price: StripePrice = self.post("/v1/prices", &form, None).await?;
        Ok(price.into())
    }

    async fn list_prices(
        &self,
        query: PriceQuery,
        page: PageRequest,
    ) -> Result<Page<LedgerPrice>, LedgerError> {
        if query.lookup_keys.len() > MAX_LOOKUP_KEYS {
            return Err(LedgerError::validation(format!(
                "At most {} lookup keys may be given.",
                MAX_LOOKUP_KEYS
            ))
            .with_param("lookup_keys"));
        }
        let mut form = Form::new();
        form.push("active", "true").push("expand[]", "data.tiers");
        for key in &query.lookup_keys {
            form.push("lookup_keys[]", key);
        }
        form.page(&page);
        let list: StripeList<StripePrice> = self.get("/v1/prices", &form).await?;
        list.try_into_page(|p| Ok(p.into()))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        page: PageRequest,
    ) -> Result<Page<LedgerSubscription>, LedgerError> {
        let mut form = Form::new();
        form.push("customer", customer_id)
            .push("status", "all")
            .push("expand[]", "data.schedule")
            .push("expand[]", "data.items.data.price.tiers");
        form.page(&page);
        let list: StripeList<StripeSubscription> = self.get("/v1/subscriptions", &form).await?;
        list.try_into_page(LedgerSubscription::try_from)
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<LedgerSchedule, LedgerError> {
        let schedule: StripeSchedule = self
            .get(
                &format!("/v1/subscription_schedules/{}", schedule_id),
                &Form::new(),
            )
            .await?;
        schedule.try_into()
    }

    async fn create_schedule(
        &self,
        request: CreateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut form = Form::new();
        form.push("customer", &request.customer_id)
            .push("start_date", effective_param(&request.start))
            .push("end_behavior", request.end_behavior.as_ledger_str())
            .metadata("metadata", &request.metadata);
        phase_params(&mut form, &request.phases);

        let schedule: StripeSchedule = self
            .post("/v1/subscription_schedules", &form, None)
            .await?;
        schedule.try_into()
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut form = Form::new();
        form.push("from_subscription", subscription_id);
        let schedule: StripeSchedule = self
            .post("/v1/subscription_schedules", &form, None)
            .await?;
        schedule.try_into()
    }

    async fn update_schedule(
        &self,
        schedule_id: &str,
        request: UpdateScheduleRequest,
    ) -> Result<LedgerSchedule, LedgerError> {
        let mut form = Form::new();
        form.push("end_behavior", request.end_behavior.as_ledger_str())
            .push(
                "proration_behavior",
                if request.prorate { "create_prorations" } else { "none" },
            );
        phase_params(&mut form, &request.phases);

        let schedule: StripeSchedule = self
            .post(
                &format!("/v1/subscription_schedules/{}", schedule_id),
                &form,
                None,
            )
            .await?;
        schedule.try_into()
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
        invoice_now: bool,
    ) -> Result<LedgerSubscription, LedgerError> {
        let mut form = Form::new();
        form.push("prorate", prorate).push("invoice_now", invoice_now);
        let subscription: StripeSubscription = self
            .call(
                Method::DELETE,
                &format!("/v1/subscriptions/{}", subscription_id),
                &form,
                None,
            )
            .await?;
        subscription.try_into()
    }

    async fn create_usage_record(&self, request: UsageRecordRequest) -> Result<(), LedgerError> {
        let mut form = Form::new();
        form.push("quantity", request.quantity)
            .push("timestamp", effective_param(&request.timestamp))
            .push("action", request.action.as_ledger_str());
        let _: serde_json::Value = self
            .post(
                &format!(
                    "/v1/subscription_items/{}/usage_records",
                    request.subscription_item_id
                ),
                &form,
                Some(&request.idempotency_key),
            )
            .await?;
        Ok(())
    }

    async fn usage_total(&self, subscription_item_id: &str) -> Result<i64, LedgerError> {
        let mut form = Form::new();
        form.push("limit", 1);
        let list: StripeList<StripeUsageSummary> = self
            .get(
                &format!(
                    "/v1/subscription_items/{}/usage_record_summaries",
                    subscription_item_id
                ),
                &form,
            )
            .await?;
        Ok(list.data.first().map(|s| s.total_usage).unwrap_or(0))
    }

    async fn create_test_clock(
        &self,
        name: &str,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError> {
        let mut form = Form::new();
        form.push("name", name)
            .push("frozen_time", frozen_time.as_unix());
        let clock: StripeTestClock = self
            .post("/v1/test_helpers/test_clocks", &form, None)
            .await?;
        clock.try_into()
    }

    async fn advance_test_clock(
        &self,
        clock_id: &ClockId,
        frozen_time: Timestamp,
    ) -> Result<LedgerClock, LedgerError> {
        let mut form = Form::new();
        form.push("frozen_time", frozen_time.as_unix());
        let clock: StripeTestClock = self
            .post(
                &format!("/v1/test_helpers/test_clocks/{}/advance", clock_id),
                &form,
                None,
            )
            .await?;
        clock.try_into()
    }

    async fn get_test_clock(&self, clock_id: &ClockId) -> Result<LedgerClock, LedgerError> {
        let clock: StripeTestClock = self
            .get(
                &format!("/v1/test_helpers/test_clocks/{}", clock_id),
                &Form::new(),
            )
            .await?;
        clock.try_into()
    }
}
