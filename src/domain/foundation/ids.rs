//! Strongly-typed identifier value objects.
//!
//! Every identifier has a canonical text form that is also its wire form:
//!
//! | Type | Text form |
//! |------|-----------|
//! | `OrgId` | `org:<id>` |
//! | `PlanId` | `plan:<name>@<version>` |
//! | `FeatureName` | `feature:<name>` |
//! | `FeaturePlan` | `feature:<name>@plan:<name>@<version>` |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ValidationError;

const ORG_PREFIX: &str = "org:";
const PLAN_PREFIX: &str = "plan:";
const FEATURE_PREFIX: &str = "feature:";

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-')
}

fn check_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::empty_field(field));
    }
    if let Some(bad) = name.chars().find(|c| !is_name_char(*c)) {
        return Err(ValidationError::invalid_format(
            field,
            format!("unexpected character {:?}", bad),
        ));
    }
    Ok(())
}

/// Caller-chosen tenant identifier, 1:1 with a ledger customer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrgId(String);

impl OrgId {
    /// Parses an org id, requiring the `org:` prefix.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let rest = s
            .strip_prefix(ORG_PREFIX)
            .ok_or_else(|| ValidationError::invalid_format("org", "must start with \"org:\""))?;
        if rest.is_empty() {
            return Err(ValidationError::empty_field("org"));
        }
        if rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::invalid_format(
                "org",
                "must not contain whitespace",
            ));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrgId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrgId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<OrgId> for String {
    fn from(id: OrgId) -> Self {
        id.0
    }
}

/// Versioned plan identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlanId {
    name: String,
    version: String,
}

impl PlanId {
    /// Creates a plan id from its parts. `name` excludes the `plan:` prefix.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let version = version.into();
        check_name("plan", &name)?;
        if version.is_empty() {
            return Err(ValidationError::empty_field("plan version"));
        }
        if !version.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::invalid_format(
                "plan version",
                "must be alphanumeric",
            ));
        }
        Ok(Self { name, version })
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let rest = s
            .strip_prefix(PLAN_PREFIX)
            .ok_or_else(|| ValidationError::invalid_format("plan", "must start with \"plan:\""))?;
        let (name, version) = rest
            .rsplit_once('@')
            .ok_or_else(|| ValidationError::invalid_format("plan", "missing \"@<version>\""))?;
        Self::new(name, version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", PLAN_PREFIX, self.name, self.version)
    }
}

impl FromStr for PlanId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PlanId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PlanId> for String {
    fn from(id: PlanId) -> Self {
        id.to_string()
    }
}

/// Name of a feature, independent of any plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureName(String);

impl FeatureName {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let rest = s.strip_prefix(FEATURE_PREFIX).ok_or_else(|| {
            ValidationError::invalid_format("feature", "must start with \"feature:\"")
        })?;
        check_name("feature", rest)?;
        Ok(Self(rest.to_string()))
    }

    /// Name without the `feature:` prefix.
    pub fn short(&self) -> &str {
        &self.0
    }

    /// Binds this feature to a plan.
    pub fn with_plan(&self, plan: &PlanId) -> FeaturePlan {
        FeaturePlan {
            plan: plan.clone(),
            feature: self.clone(),
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", FEATURE_PREFIX, self.0)
    }
}

impl FromStr for FeatureName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FeatureName {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FeatureName> for String {
    fn from(name: FeatureName) -> Self {
        name.to_string()
    }
}

/// One priced entitlement: a feature within a specific plan version.
///
/// Field order makes the derived ordering sort by plan first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeaturePlan {
    plan: PlanId,
    feature: FeatureName,
}

impl FeaturePlan {
    pub fn new(feature: FeatureName, plan: PlanId) -> Self {
        Self { plan, feature }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let (feature, plan) = s.split_once("@plan:").ok_or_else(|| {
            ValidationError::invalid_format("feature plan", "expected \"feature:<name>@plan:<name>@<version>\"")
        })?;
        let feature = FeatureName::parse(feature)?;
        let plan = PlanId::parse(&format!("{}{}", PLAN_PREFIX, plan))?;
        Ok(Self { plan, feature })
    }

    pub fn feature(&self) -> &FeatureName {
        &self.feature
    }

    pub fn plan(&self) -> &PlanId {
        &self.plan
    }
}

impl fmt::Display for FeaturePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.feature, self.plan)
    }
}

impl FromStr for FeaturePlan {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FeaturePlan {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FeaturePlan> for String {
    fn from(fp: FeaturePlan) -> Self {
        fp.to_string()
    }
}

/// Identifier of a provider-side simulated clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockId(String);

impl ClockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_id_requires_prefix() {
        assert!(OrgId::parse("org:acme").is_ok());
        assert!(OrgId::parse("acme").is_err());
        assert!(OrgId::parse("org:").is_err());
        assert!(OrgId::parse("org:has space").is_err());
    }

    #[test]
    fn plan_id_parses_name_and_version() {
        let plan = PlanId::parse("plan:pro:team@3").unwrap();
        assert_eq!(plan.name(), "pro:team");
        assert_eq!(plan.version(), "3");
        assert_eq!(plan.to_string(), "plan:pro:team@3");
    }

    #[test]
    fn plan_id_rejects_missing_version() {
        assert!(PlanId::parse("plan:pro").is_err());
        assert!(PlanId::parse("plan:pro@").is_err());
        assert!(PlanId::parse("pro@1").is_err());
    }

    #[test]
    fn feature_plan_round_trips_text_form() {
        let fp = FeaturePlan::parse("feature:tokens@plan:free@0").unwrap();
        assert_eq!(fp.feature().short(), "tokens");
        assert_eq!(fp.plan().to_string(), "plan:free@0");
        assert_eq!(fp.to_string(), "feature:tokens@plan:free@0");
    }

    #[test]
    fn feature_plan_orders_by_plan_first() {
        let a = FeaturePlan::parse("feature:z@plan:a@0").unwrap();
        let b = FeaturePlan::parse("feature:a@plan:b@0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn ids_serialize_as_text() {
        let fp = FeaturePlan::parse("feature:x@plan:test@0").unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"feature:x@plan:test@0\"");
        let back: FeaturePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);

        let bad: Result<OrgId, _> = serde_json::from_str("\"acme\"");
        assert!(bad.is_err());
    }
}
