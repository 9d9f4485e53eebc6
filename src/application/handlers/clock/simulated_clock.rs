//! SimulatedClockHandler - drives ledger-side test clocks.
//!
//! Customers attached to a clock see the clock's time instead of the wall
//! clock, so schedules and billing periods can be fast-forwarded in tests.

use std::sync::Arc;

use crate::application::cancel::Cancellation;
use crate::application::retry::Backoff;
use crate::domain::errors::ControlError;
use crate::domain::foundation::{ClockId, Timestamp};
use crate::ports::{ClockStatus, LedgerClient, LedgerClock, LedgerError};

pub struct SimulatedClockHandler {
    ledger: Arc<dyn LedgerClient>,
    backoff: Backoff,
}

impl SimulatedClockHandler {
    pub fn new(ledger: Arc<dyn LedgerClient>, backoff: Backoff) -> Self {
        Self { ledger, backoff }
    }

    /// Creates a clock frozen at `start`.
    pub async fn create(&self, name: &str, start: Timestamp) -> Result<ClockId, ControlError> {
        let clock = self
            .ledger
            .create_test_clock(name, start)
            .await
            .map_err(|e| e.into_control("create_test_clock", name))?;
        tracing::info!(clock = %clock.id, start = %start, "Created simulated clock");
        Ok(clock.id)
    }

    /// Starts moving the clock to `to`. The ledger settles asynchronously;
    /// see [`SimulatedClockHandler::wait_until_ready`].
    pub async fn advance(&self, id: &ClockId, to: Timestamp) -> Result<(), ControlError> {
        self.ledger
            .advance_test_clock(id, to)
            .await
            .map_err(|e| e.into_control("advance_test_clock", id))?;
        tracing::info!(clock = %id, to = %to, "Advancing simulated clock");
        Ok(())
    }

    /// Polls until the clock is ready, backing off between polls.
    pub async fn wait_until_ready(
        &self,
        id: &ClockId,
        mut cancel: Cancellation,
    ) -> Result<LedgerClock, ControlError> {
        let mut attempt = 0;
        loop {
            cancel.check()?;
            let clock = self.get(id).await?;
            match clock.status {
                ClockStatus::Ready => return Ok(clock),
                ClockStatus::InternalFailure => {
                    tracing::warn!(clock = %id, "Simulated clock failed while advancing");
                    return Err(LedgerError::provider("test clock reported internal_failure")
                        .into_control("wait_for_clock", id));
                }
                ClockStatus::Advancing => {
                    tracing::debug!(clock = %id, attempt, "Clock still advancing");
                    cancel.sleep(self.backoff.delay(attempt)).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// The clock's current frozen time.
    pub async fn now(&self, id: &ClockId) -> Result<Timestamp, ControlError> {
        Ok(self.get(id).await?.frozen_time)
    }

    async fn get(&self, id: &ClockId) -> Result<LedgerClock, ControlError> {
        self.ledger
            .get_test_clock(id)
            .await
            .map_err(|e| e.into_control("get_test_clock", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stripe::InMemoryLedger;
    use std::time::Duration;

    fn handler(ledger: &InMemoryLedger) -> SimulatedClockHandler {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        SimulatedClockHandler::new(Arc::new(ledger.clone()), backoff)
    }

    #[tokio::test]
    async fn advance_then_wait_reaches_target_time() {
        let ledger = InMemoryLedger::new();
        ledger.set_advance_polls(3);
        let clocks = handler(&ledger);
        let start = Timestamp::from_unix(1_700_000_000).unwrap();

        let id = clocks.create("billing", start).await.unwrap();
        clocks.advance(&id, start.add_days(31)).await.unwrap();
        let clock = clocks.wait_until_ready(&id, Cancellation::none()).await.unwrap();

        assert_eq!(clock.status, ClockStatus::Ready);
        assert_eq!(clocks.now(&id).await.unwrap(), start.add_days(31));
        assert!(ledger.call_count("get_test_clock") >= 3);
    }

    #[tokio::test]
    async fn failed_clock_is_an_error() {
        let ledger = InMemoryLedger::new();
        let clocks = handler(&ledger);
        let start = Timestamp::from_unix(1_700_000_000).unwrap();
        let id = clocks.create("billing", start).await.unwrap();
        ledger.fail_clock(&id);

        assert!(clocks.wait_until_ready(&id, Cancellation::none()).await.is_err());
    }

    #[tokio::test]
    async fn moving_backwards_is_rejected() {
        let ledger = InMemoryLedger::new();
        let clocks = handler(&ledger);
        let start = Timestamp::from_unix(1_700_000_000).unwrap();
        let id = clocks.create("billing", start).await.unwrap();
        assert!(clocks.advance(&id, start.add_days(-1)).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_wait_stops_polling() {
        let ledger = InMemoryLedger::new();
        ledger.set_advance_polls(u32::MAX);
        let clocks = handler(&ledger);
        let start = Timestamp::from_unix(1_700_000_000).unwrap();
        let id = clocks.create("billing", start).await.unwrap();
        clocks.advance(&id, start.add_days(1)).await.unwrap();

        let (handle, token) = Cancellation::pair();
        handle.cancel();
        let err = clocks.wait_until_ready(&id, token).await.unwrap_err();
        assert!(matches!(err, ControlError::Cancelled));
    }
}
