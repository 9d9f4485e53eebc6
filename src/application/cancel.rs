//! Caller-driven cancellation for retry and polling loops.
//!
//! Dropping an operation's future already cancels it. Loops that sleep
//! between attempts also watch a [`Cancellation`] so they stop promptly and
//! report [`ControlError::Cancelled`] instead of retrying.

use std::time::Duration;
use tokio::sync::watch;

use crate::domain::errors::ControlError;

/// Sending side; `cancel()` stops every linked [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        // No receivers left means nothing to stop.
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cancellation(Option<watch::Receiver<bool>>);

impl Cancellation {
    /// A token that never fires.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self(Some(receiver))
    }

    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), Self::new(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    pub fn check(&self) -> Result<(), ControlError> {
        if self.is_cancelled() {
            Err(ControlError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancelled. Never resolves for [`Cancellation::none`]
    /// or after the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        match self.0.as_mut() {
            Some(rx) => {
                let sender_gone = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if sender_gone {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Sleeps for `delay` unless cancelled first.
    pub async fn sleep(&mut self, delay: Duration) -> Result<(), ControlError> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancelled() => Err(ControlError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let mut token = Cancellation::none();
        assert!(token.sleep(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let (handle, mut token) = Cancellation::pair();
        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(30)).await });
        handle.cancel();
        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(ControlError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_fails_fast() {
        let (handle, mut token) = Cancellation::pair();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
        assert!(token.sleep(Duration::from_secs(30)).await.is_err());
    }
}
