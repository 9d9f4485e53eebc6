//! Stripe API objects as they arrive over the wire.
//!
//! These types are designed to:
//! - Parse actual Stripe JSON, tolerating fields we never read
//! - Accept both collapsed ids and expanded objects where Stripe allows `expand[]`
//! - Convert into the ledger port types in one place

use serde::Deserialize;
use std::collections::HashMap;

use crate::domain::catalog::{Aggregate, Divide, Interval, Rounding, TierMode};
use crate::domain::foundation::{ClockId, Timestamp};
use crate::ports::{
    ClockStatus, CurrentPhase, EndBehavior, LedgerClock, LedgerCustomer, LedgerError,
    LedgerErrorCode, LedgerPhase, LedgerPrice, LedgerSchedule, LedgerSubscription, Page,
    PriceTier, ScheduleStatus, SubscriptionItem, SubscriptionStatus,
};

fn timestamp(secs: i64) -> Result<Timestamp, LedgerError> {
    Timestamp::from_unix(secs)
        .map_err(|e| LedgerError::provider(format!("invalid timestamp {}: {}", secs, e)))
}

fn timestamp_opt(secs: Option<i64>) -> Result<Option<Timestamp>, LedgerError> {
    secs.map(timestamp).transpose()
}

// ════════════════════════════════════════════════════════════════════════════════
// Envelopes
// ════════════════════════════════════════════════════════════════════════════════

/// A field Stripe returns either as an id or, when expanded, as the object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: HasId> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => obj.id(),
        }
    }

    pub fn into_object(self) -> Option<T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(obj) => Some(*obj),
        }
    }
}

pub trait HasId {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> StripeList<T> {
    /// Converts every element, failing on the first bad one.
    pub fn try_into_page<U>(
        self,
        convert: impl Fn(T) -> Result<U, LedgerError>,
    ) -> Result<Page<U>, LedgerError> {
        Ok(Page {
            data: self.data.into_iter().map(convert).collect::<Result<_, _>>()?,
            has_more: self.has_more,
        })
    }
}

/// Error body: `{"error": {"type": ..., "code": ..., "message": ..., "param": ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorBody {
    pub error: StripeErrorDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StripeErrorDetail {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
}

impl StripeErrorDetail {
    /// Maps a Stripe error onto the port's error codes.
    pub fn into_ledger_error(self, http_status: u16) -> LedgerError {
        let message = self.message.unwrap_or_else(|| self.error_type.clone());
        let code = match (self.code.as_deref(), http_status) {
            (_, 429) => LedgerErrorCode::RateLimited,
            (Some("resource_missing"), _) | (_, 404) => LedgerErrorCode::NotFound,
            (Some("resource_already_exists"), _) => LedgerErrorCode::AlreadyExists,
            _ if message.contains("already uses") => LedgerErrorCode::AlreadyExists,
            _ if self.error_type == "invalid_request_error" => LedgerErrorCode::Validation,
            _ if self.error_type == "api_error" || http_status >= 500 => LedgerErrorCode::Provider,
            _ => LedgerErrorCode::Unknown,
        };
        let mut err = LedgerError::new(code, message).with_status(http_status);
        if let Some(param) = self.param {
            err = err.with_param(param);
        }
        err
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeDeleted {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

// ════════════════════════════════════════════════════════════════════════════════
// Customers and products
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub test_clock: Option<Expandable<StripeTestClock>>,
    #[serde(default)]
    pub deleted: bool,
}

impl HasId for StripeCustomer {
    fn id(&self) -> &str {
        &self.id
    }
}

impl From<StripeCustomer> for LedgerCustomer {
    fn from(c: StripeCustomer) -> Self {
        LedgerCustomer {
            test_clock: c.test_clock.as_ref().map(|clock| ClockId::new(clock.id())),
            id: c.id,
            email: c.email,
            name: c.name,
            description: c.description,
            phone: c.phone,
            metadata: c.metadata,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeProduct {
    pub id: String,
}

impl HasId for StripeProduct {
    fn id(&self) -> &str {
        &self.id
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Prices
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct StripeRecurring {
    pub interval: String,
    #[serde(default)]
    pub usage_type: Option<String>,
    #[serde(default)]
    pub aggregate_usage: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeTier {
    #[serde(default)]
    pub up_to: Option<i64>,
    #[serde(default)]
    pub unit_amount_decimal: Option<String>,
    #[serde(default)]
    pub flat_amount: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeTransform {
    pub divide_by: i64,
    pub round: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
    #[serde(default)]
    pub lookup_key: Option<String>,
    pub product: Expandable<StripeProduct>,
    pub currency: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub recurring: Option<StripeRecurring>,
    #[serde(default)]
    pub unit_amount_decimal: Option<String>,
    #[serde(default)]
    pub tiers_mode: Option<String>,
    #[serde(default)]
    pub tiers: Option<Vec<StripeTier>>,
    #[serde(default)]
    pub transform_quantity: Option<StripeTransform>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HasId for StripePrice {
    fn id(&self) -> &str {
        &self.id
    }
}

impl From<StripePrice> for LedgerPrice {
    fn from(p: StripePrice) -> Self {
        let recurring = p.recurring.as_ref();
        LedgerPrice {
            product_id: p.product.id().to_string(),
            interval: recurring.and_then(|r| Interval::from_ledger_str(&r.interval)),
            metered: recurring.and_then(|r| r.usage_type.as_deref()) == Some("metered"),
            aggregate: recurring
                .and_then(|r| r.aggregate_usage.as_deref())
                .and_then(Aggregate::from_ledger_str),
            tiers_mode: p.tiers_mode.as_deref().and_then(TierMode::from_ledger_str),
            tiers: p
                .tiers
                .unwrap_or_default()
                .into_iter()
                .map(|t| PriceTier {
                    up_to: t.up_to,
                    unit_amount_decimal: t.unit_amount_decimal,
                    flat_amount: t.flat_amount,
                })
                .collect(),
            transform: p.transform_quantity.map(|t| Divide {
                by: t.divide_by,
                rounding: Rounding::from_ledger_str(&t.round).unwrap_or_default(),
            }),
            id: p.id,
            lookup_key: p.lookup_key,
            currency: p.currency,
            active: p.active,
            unit_amount_decimal: p.unit_amount_decimal,
            metadata: p.metadata,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Subscriptions and schedules
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: String,
    pub price: StripePrice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Expandable<StripeCustomer>,
    pub status: String,
    #[serde(default)]
    pub schedule: Option<Expandable<StripeSchedule>>,
    pub items: StripeList<StripeSubscriptionItem>,
    pub created: i64,
    pub start_date: i64,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
}

impl TryFrom<StripeSubscription> for LedgerSubscription {
    type Error = LedgerError;

    fn try_from(s: StripeSubscription) -> Result<Self, Self::Error> {
        let schedule = s
            .schedule
            .and_then(Expandable::into_object)
            .map(LedgerSchedule::try_from)
            .transpose()?;
        Ok(LedgerSubscription {
            customer_id: s.customer.id().to_string(),
            status: SubscriptionStatus::from_ledger_str(&s.status),
            schedule,
            items: s
                .items
                .data
                .into_iter()
                .map(|item| SubscriptionItem {
                    id: item.id,
                    price: item.price.into(),
                })
                .collect(),
            created: timestamp(s.created)?,
            start_date: timestamp(s.start_date)?,
            current_period_start: timestamp_opt(s.current_period_start)?,
            current_period_end: timestamp_opt(s.current_period_end)?,
            trial_start: timestamp_opt(s.trial_start)?,
            trial_end: timestamp_opt(s.trial_end)?,
            cancel_at: timestamp_opt(s.cancel_at)?,
            canceled_at: timestamp_opt(s.canceled_at)?,
            ended_at: timestamp_opt(s.ended_at)?,
            id: s.id,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCurrentPhase {
    pub start_date: i64,
    #[serde(default)]
    pub end_date: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePhaseItem {
    pub price: Expandable<StripePrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePhase {
    pub start_date: i64,
    #[serde(default)]
    pub end_date: Option<i64>,
    #[serde(default)]
    pub items: Vec<StripePhaseItem>,
    #[serde(default)]
    pub trial_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSchedule {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub subscription: Option<Expandable<StripeSubscriptionRef>>,
    pub customer: Expandable<StripeCustomer>,
    #[serde(default)]
    pub current_phase: Option<StripeCurrentPhase>,
    #[serde(default)]
    pub phases: Vec<StripePhase>,
    #[serde(default)]
    pub end_behavior: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HasId for StripeSchedule {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Only the id of a subscription referenced from a schedule is read.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionRef {
    pub id: String,
}

impl HasId for StripeSubscriptionRef {
    fn id(&self) -> &str {
        &self.id
    }
}

impl TryFrom<StripeSchedule> for LedgerSchedule {
    type Error = LedgerError;

    fn try_from(s: StripeSchedule) -> Result<Self, Self::Error> {
        let current_phase = match s.current_phase {
            Some(p) => Some(CurrentPhase {
                start: timestamp(p.start_date)?,
                end: timestamp_opt(p.end_date)?,
            }),
            None => None,
        };
        let phases = s
            .phases
            .into_iter()
            .map(|p| {
                Ok(LedgerPhase {
                    start: timestamp(p.start_date)?,
                    end: timestamp_opt(p.end_date)?,
                    prices: p.items.iter().map(|i| i.price.id().to_string()).collect(),
                    trial: p.trial_end.is_some(),
                })
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;
        Ok(LedgerSchedule {
            status: ScheduleStatus::from_ledger_str(&s.status),
            subscription_id: s.subscription.as_ref().map(|sub| sub.id().to_string()),
            customer_id: s.customer.id().to_string(),
            current_phase,
            phases,
            end_behavior: s
                .end_behavior
                .as_deref()
                .map(EndBehavior::from_ledger_str)
                .unwrap_or_default(),
            metadata: s.metadata,
            id: s.id,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Usage and clocks
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct StripeUsageSummary {
    #[serde(default)]
    pub total_usage: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeTestClock {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub frozen_time: i64,
    pub status: String,
}

impl HasId for StripeTestClock {
    fn id(&self) -> &str {
        &self.id
    }
}

impl TryFrom<StripeTestClock> for LedgerClock {
    type Error = LedgerError;

    fn try_from(c: StripeTestClock) -> Result<Self, Self::Error> {
        Ok(LedgerClock {
            frozen_time: timestamp(c.frozen_time)?,
            status: ClockStatus::from_ledger_str(&c.status),
            name: c.name.unwrap_or_default(),
            id: ClockId::new(c.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parses_metered_tiers() {
        let json = r#"{
            "id": "price_1",
            "object": "price",
            "lookup_key": "feature:tokens@plan:pro@1",
            "product": "prod_1",
            "currency": "usd",
            "active": true,
            "recurring": {"interval": "month", "usage_type": "metered", "aggregate_usage": "sum"},
            "unit_amount_decimal": null,
            "tiers_mode": "graduated",
            "tiers": [
                {"up_to": 1000, "unit_amount_decimal": "0", "flat_amount": null},
                {"up_to": null, "unit_amount_decimal": "0.01", "flat_amount": 0}
            ],
            "transform_quantity": {"divide_by": 100, "round": "down"},
            "metadata": {"entitle.plan": "plan:pro@1"}
        }"#;
        let price: LedgerPrice = serde_json::from_str::<StripePrice>(json).unwrap().into();
        assert!(price.metered);
        assert_eq!(price.aggregate, Some(Aggregate::Sum));
        assert_eq!(price.tiers_mode, Some(TierMode::Graduated));
        assert_eq!(price.tiers.len(), 2);
        assert_eq!(price.tiers[1].up_to, None);
        assert_eq!(price.transform.map(|t| t.rounding), Some(Rounding::Down));
        assert_eq!(price.product_id, "prod_1");
    }

    #[test]
    fn subscription_accepts_expanded_schedule() {
        let json = r#"{
            "id": "sub_1",
            "customer": "cus_1",
            "status": "trialing",
            "schedule": {
                "id": "sub_sched_1",
                "status": "active",
                "subscription": "sub_1",
                "customer": "cus_1",
                "current_phase": {"start_date": 1700000000, "end_date": 1700864000},
                "phases": [
                    {"start_date": 1700000000, "end_date": 1700864000,
                     "items": [{"price": "price_1"}], "trial_end": 1700864000},
                    {"start_date": 1700864000, "end_date": null,
                     "items": [{"price": "price_1"}]}
                ],
                "end_behavior": "cancel",
                "metadata": {}
            },
            "items": {"object": "list", "data": [], "has_more": false},
            "created": 1700000000,
            "start_date": 1700000000
        }"#;
        let sub: LedgerSubscription = serde_json::from_str::<StripeSubscription>(json)
            .unwrap()
            .try_into()
            .unwrap();
        let schedule = sub.schedule.unwrap();
        assert_eq!(schedule.end_behavior, EndBehavior::Cancel);
        assert!(schedule.phases[0].trial);
        assert!(!schedule.phases[1].trial);
        assert_eq!(schedule.current_phase.unwrap().end, schedule.phases[0].end);
    }

    #[test]
    fn collapsed_schedule_is_dropped() {
        let json = r#"{
            "id": "sub_1", "customer": "cus_1", "status": "active",
            "schedule": "sub_sched_1",
            "items": {"data": []},
            "created": 1, "start_date": 1
        }"#;
        let sub: LedgerSubscription = serde_json::from_str::<StripeSubscription>(json)
            .unwrap()
            .try_into()
            .unwrap();
        assert!(sub.schedule.is_none());
    }

    #[test]
    fn error_codes_map_to_port_codes() {
        let missing = StripeErrorDetail {
            error_type: "invalid_request_error".into(),
            code: Some("resource_missing".into()),
            message: Some("No such customer: 'cus_x'".into()),
            param: Some("customer".into()),
        }
        .into_ledger_error(404);
        assert!(crate::ports::is_missing_customer(&missing));

        let dup = StripeErrorDetail {
            error_type: "invalid_request_error".into(),
            message: Some("A price (`price_1`) already uses that lookup key.".into()),
            ..Default::default()
        }
        .into_ledger_error(400);
        assert!(dup.is_already_exists());

        let limited = StripeErrorDetail::default().into_ledger_error(429);
        assert!(limited.retryable);

        let server = StripeErrorDetail {
            error_type: "api_error".into(),
            ..Default::default()
        }
        .into_ledger_error(500);
        assert!(server.retryable);
        assert_eq!(server.code, LedgerErrorCode::Provider);
    }
}
