//! The org's current subscription.

use crate::ports::{list_all, LedgerClient, LedgerError, LedgerSubscription};

async fn all_subscriptions(
    ledger: &dyn LedgerClient,
    customer_id: &str,
) -> Result<Vec<LedgerSubscription>, LedgerError> {
    list_all(|page| ledger.list_subscriptions(customer_id, page)).await
}

/// Newest subscription of `customer_id` that has not ended.
///
/// Orgs are kept to one live subscription, but a canceled one may linger
/// next to a newer one; listing order is newest first.
pub async fn current_subscription(
    ledger: &dyn LedgerClient,
    customer_id: &str,
) -> Result<Option<LedgerSubscription>, LedgerError> {
    let subscriptions = all_subscriptions(ledger, customer_id).await?;
    Ok(subscriptions.into_iter().find(|s| !s.status.is_ended()))
}

/// Current subscription, or the newest ended one when none is live.
pub async fn latest_subscription(
    ledger: &dyn LedgerClient,
    customer_id: &str,
) -> Result<Option<LedgerSubscription>, LedgerError> {
    let subscriptions = all_subscriptions(ledger, customer_id).await?;
    let live = subscriptions.iter().position(|s| !s.status.is_ended());
    Ok(match live {
        Some(i) => subscriptions.into_iter().nth(i),
        None => subscriptions.into_iter().next(),
    })
}
