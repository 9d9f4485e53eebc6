//! Ports - interfaces to the outside world.
//!
//! - `LedgerClient` - the remote billing ledger

mod ledger;

pub use ledger::{
    is_missing_customer, is_schedule_released, is_too_many_items, list_all, ClockStatus,
    CreateCustomerRequest, CreatePriceRequest, CreateProductRequest, CreateScheduleRequest,
    CurrentPhase, EndBehavior, LedgerClient, LedgerClock, LedgerCustomer, LedgerError,
    LedgerErrorCode, LedgerPhase, LedgerPrice, LedgerSchedule, LedgerSubscription, Listed, Page,
    PageRequest, PriceQuery, PriceTier, ScheduleStatus, SchedulePhaseParams, SubscriptionItem,
    SubscriptionStatus, UpdateCustomerRequest, UpdateScheduleRequest, UsageRecordRequest,
    MAX_LOOKUP_KEYS,
};
