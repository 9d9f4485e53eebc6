//! Local checks run on catalog entries before anything is sent to the ledger.

use std::collections::HashSet;

use super::feature::{decimal_places, CatalogEntry, INF};
use crate::domain::errors::ControlError;
use crate::domain::foundation::ValidationError;

/// Most fractional digits the ledger accepts in a decimal price.
pub const MAX_PRICE_DECIMALS: usize = 12;

fn check_price(entry: &CatalogEntry, what: &str, price: f64) -> Result<(), ControlError> {
    if !price.is_finite() {
        return Err(ControlError::invalid_price(
            &entry.feature_plan,
            format!("{} must be finite", what),
        ));
    }
    if price < 0.0 {
        return Err(ControlError::invalid_price(
            &entry.feature_plan,
            format!("{} must not be negative", what),
        ));
    }
    let places = decimal_places(price);
    if places > MAX_PRICE_DECIMALS {
        return Err(ControlError::invalid_price(
            &entry.feature_plan,
            format!(
                "{} has {} decimal places; at most {} are supported",
                what, places, MAX_PRICE_DECIMALS
            ),
        ));
    }
    Ok(())
}

/// The ledger stores currencies as lowercase ISO 4217 codes.
fn is_currency_code(currency: &str) -> bool {
    currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_lowercase())
}

/// Validates a single entry.
pub fn validate_entry(entry: &CatalogEntry) -> Result<(), ControlError> {
    let field = entry.feature_plan.to_string();

    if entry.currency.trim().is_empty() {
        return Err(ValidationError::empty_field(format!("{}: currency", field)).into());
    }
    if !is_currency_code(&entry.currency) {
        return Err(ValidationError::invalid_format(
            format!("{}: currency", field),
            "expected a lowercase three-letter ISO code",
        )
        .into());
    }
    if entry.base < 0 {
        return Err(ValidationError::out_of_range(format!("{}: base", field), 0, INF, entry.base).into());
    }
    if !entry.tiers.is_empty() && entry.base != 0 {
        return Err(ValidationError::invalid_format(
            format!("{}: base", field),
            "a base price cannot be combined with tiers",
        )
        .into());
    }
    if let Some(divide) = entry.divide {
        if divide.by <= 0 {
            return Err(ValidationError::out_of_range(format!("{}: divide", field), 1, INF, divide.by).into());
        }
    }

    let mut last_upto = 0;
    for (i, tier) in entry.tiers.iter().enumerate() {
        if tier.base < 0 {
            return Err(ValidationError::out_of_range(
                format!("{}: tiers[{}].base", field, i),
                0,
                INF,
                tier.base,
            )
            .into());
        }
        check_price(entry, &format!("tiers[{}].price", i), tier.price)?;
        // An unbounded tier can only be last, since nothing exceeds INF.
        if tier.upto <= last_upto {
            return Err(ValidationError::invalid_format(
                format!("{}: tiers[{}].upto", field, i),
                "tier bounds must be positive and strictly increasing",
            )
            .into());
        }
        last_upto = tier.upto;
    }
    Ok(())
}

/// Validates a group of entries that will be published together.
///
/// Rejects duplicate feature plans in addition to per-entry checks.
pub fn validate_entries(entries: &[CatalogEntry]) -> Result<(), ControlError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(&entry.feature_plan) {
            return Err(ValidationError::invalid_format(
                entry.feature_plan.to_string(),
                "feature listed more than once",
            )
            .into());
        }
        validate_entry(entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::{Divide, Rounding, Tier};
    use crate::domain::foundation::FeaturePlan;
    use proptest::prelude::*;

    fn entry() -> CatalogEntry {
        CatalogEntry::new(FeaturePlan::parse("feature:t@plan:test@0").unwrap())
    }

    fn tier(upto: i64, price: f64) -> Tier {
        Tier { upto, price, base: 0 }
    }

    #[test]
    fn accepts_plain_licensed_entry() {
        assert!(validate_entry(&entry()).is_ok());
    }

    #[test]
    fn rejects_negative_base() {
        let mut e = entry();
        e.base = -1;
        assert!(matches!(validate_entry(&e), Err(ControlError::Validation(_))));
    }

    #[test]
    fn rejects_base_with_tiers() {
        let mut e = entry();
        e.base = 100;
        e.tiers = vec![tier(INF, 1.0)];
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn rejects_non_increasing_tiers() {
        let mut e = entry();
        e.tiers = vec![tier(10, 1.0), tier(10, 2.0)];
        assert!(validate_entry(&e).is_err());

        e.tiers = vec![tier(INF, 1.0), tier(10, 2.0)];
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn rejects_excess_precision_as_invalid_price() {
        let mut e = entry();
        e.tiers = vec![tier(INF, 0.0000000000001)];
        assert!(matches!(validate_entry(&e), Err(ControlError::InvalidPrice { .. })));

        e.tiers = vec![tier(INF, 0.000000000001)];
        assert!(validate_entry(&e).is_ok());
    }

    #[test]
    fn rejects_zero_divisor() {
        let mut e = entry();
        e.divide = Some(Divide { by: 0, rounding: Rounding::Up });
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn rejects_currency_the_ledger_would_rewrite() {
        for currency in ["USD", "Eur", "usdc", "u$d"] {
            let mut e = entry();
            e.currency = currency.to_string();
            assert!(validate_entry(&e).is_err(), "{} accepted", currency);
        }
        let mut e = entry();
        e.currency = "jpy".to_string();
        assert!(validate_entry(&e).is_ok());
    }

    #[test]
    fn rejects_duplicate_features() {
        let entries = vec![entry(), entry()];
        assert!(validate_entries(&entries).is_err());
    }

    proptest! {
        #[test]
        fn strictly_increasing_bounds_always_validate(
            steps in proptest::collection::vec(1i64..1_000, 1..8),
            cents in 0u32..100_000,
        ) {
            let mut e = entry();
            let mut upto = 0;
            e.tiers = steps
                .iter()
                .map(|step| {
                    upto += step;
                    tier(upto, f64::from(cents) / 100.0)
                })
                .collect();
            prop_assert!(validate_entry(&e).is_ok());
            prop_assert_eq!(e.limit(), upto);
        }
    }
}
