//! Engine error taxonomy.
//!
//! | Error | Meaning |
//! |-------|---------|
//! | OrgNotFound | no ledger customer is tagged with the org |
//! | FeatureNotFound | a referenced feature is not published / not entitled |
//! | FeatureNotMetered | usage reported against a licensed feature |
//! | PlanExists | plan already published (immutability) |
//! | FeatureExists | feature already published (idempotent re-push) |
//! | InvalidMetadata | caller metadata uses the reserved prefix |
//! | InvalidPrice | price precision exceeds the ledger's limit |
//! | TooManyItems | a phase exceeds the per-schedule item cap |
//! | UnexpectedMissingOrg | cached customer vanished between lookup and write |
//! | InvalidPhase | malformed phase list |
//! | Validation | malformed value object |
//! | Cancelled / DeadlineExceeded | caller cancellation or bounded deadline |
//! | Ledger | any other ledger failure, wrapped with context |

use thiserror::Error;

use super::foundation::{FeaturePlan, OrgId, PlanId, ValidationError};

/// Boxed ledger failure carried inside [`ControlError::Ledger`].
pub type LedgerSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("org not found: {0}")]
    OrgNotFound(OrgId),

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    #[error("feature not metered: {0}")]
    FeatureNotMetered(FeaturePlan),

    #[error("plan already exists: {0}")]
    PlanExists(PlanId),

    #[error("feature already exists: {0}")]
    FeatureExists(FeaturePlan),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid price for {feature}: {reason}")]
    InvalidPrice { feature: FeaturePlan, reason: String },

    #[error("too many items in phase: {count} exceeds the limit of {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("org {0} vanished from the ledger while in use")]
    UnexpectedMissingOrg(OrgId),

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} did not complete within {millis}ms")]
    DeadlineExceeded { operation: &'static str, millis: u64 },

    #[error("{operation} failed ({context}): {source}")]
    Ledger {
        operation: &'static str,
        context: String,
        #[source]
        source: LedgerSource,
    },
}

impl ControlError {
    pub fn feature_not_found(what: impl ToString) -> Self {
        ControlError::FeatureNotFound(what.to_string())
    }

    pub fn invalid_phase(reason: impl Into<String>) -> Self {
        ControlError::InvalidPhase(reason.into())
    }

    pub fn invalid_price(feature: &FeaturePlan, reason: impl Into<String>) -> Self {
        ControlError::InvalidPrice {
            feature: feature.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from caller input rather than the ledger.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ControlError::InvalidMetadata(_)
                | ControlError::InvalidPrice { .. }
                | ControlError::TooManyItems { .. }
                | ControlError::InvalidPhase(_)
                | ControlError::Validation(_)
        )
    }

    /// Short machine-readable code, stable across message changes.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::OrgNotFound(_) => "org_not_found",
            ControlError::FeatureNotFound(_) => "feature_not_found",
            ControlError::FeatureNotMetered(_) => "feature_not_metered",
            ControlError::PlanExists(_) => "plan_exists",
            ControlError::FeatureExists(_) => "feature_exists",
            ControlError::InvalidMetadata(_) => "invalid_metadata",
            ControlError::InvalidPrice { .. } => "invalid_price",
            ControlError::TooManyItems { .. } => "too_many_items",
            ControlError::UnexpectedMissingOrg(_) => "unexpected_missing_org",
            ControlError::InvalidPhase(_) => "invalid_phase",
            ControlError::Validation(_) => "validation_failed",
            ControlError::Cancelled => "cancelled",
            ControlError::DeadlineExceeded { .. } => "deadline_exceeded",
            ControlError::Ledger { .. } => "ledger_error",
        }
    }
}
