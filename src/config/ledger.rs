//! Ledger connection configuration

use serde::Deserialize;

use super::error::ValidationError;
use crate::adapters::stripe::StripeConfig;

/// Credentials and endpoint for the billing ledger.
#[derive(Clone, Default, Deserialize)]
pub struct LedgerConfig {
    /// Secret (`sk_...`) or restricted (`rk_...`) API key
    pub api_key: String,

    /// Override for the API host, e.g. a local mock
    pub base_url: Option<String>,

    /// Connected account to act on behalf of
    pub account: Option<String>,

    /// Pinned API version
    pub api_version: Option<String>,
}

impl LedgerConfig {
    /// Live keys carry a `_live_` segment; everything else is test mode.
    pub fn is_live(&self) -> bool {
        self.api_key.contains("_live_")
    }

    /// Validate ledger configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.api_key.is_empty() {
            return Err(ValidationError::MissingRequired("LEDGER__API_KEY"));
        }
        if !self.api_key.starts_with("sk_") && !self.api_key.starts_with("rk_") {
            return Err(ValidationError::InvalidLedgerKey);
        }
        if let Some(url) = &self.base_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(ValidationError::InvalidBaseUrl);
            }
        }
        Ok(())
    }

    /// Adapter configuration for [`crate::adapters::stripe::StripeLedgerAdapter`].
    pub fn to_stripe_config(&self) -> StripeConfig {
        let mut config = StripeConfig::new(self.api_key.clone());
        if let Some(url) = &self.base_url {
            config = config.with_base_url(url.clone());
        }
        if let Some(account) = &self.account {
            config = config.with_account(account.clone());
        }
        if let Some(version) = &self.api_version {
            config = config.with_api_version(version.clone());
        }
        config
    }
}

impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("account", &self.account)
            .field("api_version", &self.api_version)
            .finish()
    }
}
