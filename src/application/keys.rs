//! Deterministic ledger keys derived from engine identifiers.

use sha2::{Digest, Sha256};

use crate::domain::foundation::{ClockId, OrgId, PlanId};

fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Idempotency key for creating an org's customer.
///
/// Orgs scoped to a simulated clock get a distinct key per clock.
pub fn customer_idempotency_key(org: &OrgId, clock: Option<&ClockId>) -> String {
    let subject = match clock {
        Some(clock) => format!("{}:{}", org, clock),
        None => org.to_string(),
    };
    format!("entitle:customer:{}", sha256_hex(&subject))
}

/// Product id of the inactive sentinel that claims a plan.
pub fn plan_sentinel_id(plan: &PlanId) -> String {
    format!("entitle__{}", &sha256_hex(&plan.to_string())[..40])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_key_is_stable_and_clock_scoped() {
        let org = OrgId::parse("org:acme").unwrap();
        let clock = ClockId::new("clock_1");
        assert_eq!(
            customer_idempotency_key(&org, None),
            customer_idempotency_key(&org, None)
        );
        assert_ne!(
            customer_idempotency_key(&org, None),
            customer_idempotency_key(&org, Some(&clock))
        );
        assert!(customer_idempotency_key(&org, None).starts_with("entitle:customer:"));
    }

    #[test]
    fn sentinel_ids_differ_per_plan_version() {
        let v0 = plan_sentinel_id(&PlanId::parse("plan:pro@0").unwrap());
        let v1 = plan_sentinel_id(&PlanId::parse("plan:pro@1").unwrap());
        assert_ne!(v0, v1);
        assert_eq!(v0.len(), "entitle__".len() + 40);
        assert!(v0.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
