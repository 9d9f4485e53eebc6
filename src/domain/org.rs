//! Org profile data carried on the ledger customer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::ControlError;
use super::foundation::{ClockId, OrgId};
use super::metadata;

/// Caller-supplied customer details for an org.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl OrgInfo {
    /// Rejects metadata keys in the engine's reserved namespace.
    pub fn validate(&self) -> Result<(), ControlError> {
        let mut reserved: Vec<&str> = self
            .metadata
            .keys()
            .map(String::as_str)
            .filter(|k| metadata::is_reserved(k))
            .collect();
        if reserved.is_empty() {
            return Ok(());
        }
        reserved.sort_unstable();
        Err(ControlError::InvalidMetadata(format!(
            "keys starting with {:?} are reserved: {}",
            metadata::PREFIX,
            reserved.join(", ")
        )))
    }

    /// Builds info from customer fields, dropping reserved metadata.
    pub fn from_customer_fields(
        email: Option<String>,
        name: Option<String>,
        description: Option<String>,
        phone: Option<String>,
        all_metadata: &HashMap<String, String>,
    ) -> Self {
        Self {
            email,
            name,
            description,
            phone,
            metadata: all_metadata
                .iter()
                .filter(|(k, _)| !metadata::is_reserved(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// An org as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRecord {
    pub org: OrgId,
    pub customer_id: String,
    pub info: OrgInfo,
    pub clock: Option<ClockId>,
}
