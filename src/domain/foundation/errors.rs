//! Input errors raised while parsing identifiers and checking entries.

use thiserror::Error;

/// A value the caller supplied (or the ledger returned) does not fit the
/// domain's rules. `field` names the offending input, e.g. `"tiers[1].upto"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    EmptyField { field: String },

    #[error("{field} = {actual} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        min: i64,
        max: i64,
        actual: i64,
    },

    #[error("{field} is malformed: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    pub fn empty_field(field: impl Into<String>) -> Self {
        Self::EmptyField { field: field.into() }
    }

    pub fn out_of_range(field: impl Into<String>, min: i64, max: i64, actual: i64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            min,
            max,
            actual,
        }
    }

    pub fn invalid_format(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The input the error is about.
    pub fn field(&self) -> &str {
        match self {
            Self::EmptyField { field }
            | Self::OutOfRange { field, .. }
            | Self::InvalidFormat { field, .. } => field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_field() {
        assert_eq!(
            ValidationError::empty_field("currency").to_string(),
            "currency is required"
        );
        assert_eq!(
            ValidationError::out_of_range("divide.by", 1, i64::MAX, 0).to_string(),
            format!("divide.by = 0 is outside [1, {}]", i64::MAX)
        );
        assert_eq!(
            ValidationError::invalid_format("org", "expected org:<id>").to_string(),
            "org is malformed: expected org:<id>"
        );
    }

    #[test]
    fn field_is_exposed_for_every_variant() {
        assert_eq!(ValidationError::empty_field("a").field(), "a");
        assert_eq!(ValidationError::out_of_range("b", 0, 1, 2).field(), "b");
        assert_eq!(ValidationError::invalid_format("c", "x").field(), "c");
    }
}
