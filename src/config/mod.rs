//! Engine configuration.
//!
//! Everything is read from `ENTITLE__*` environment variables (a `.env` file
//! is honoured during development). Sections nest with a double underscore:
//! `ENTITLE__ENGINE__CACHE_CAPACITY=500` sets `engine.cache_capacity`.
//!
//! ```no_run
//! use entitle::config::{init_tracing, AppConfig};
//!
//! # fn main() -> Result<(), entitle::config::ConfigError> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! init_tracing(&config.telemetry);
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod ledger;
mod telemetry;

pub use engine::EngineConfig;
pub use error::{ConfigError, ValidationError};
pub use ledger::LedgerConfig;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

use serde::Deserialize;

const ENV_PREFIX: &str = "ENTITLE";

/// Root configuration. Only the ledger section is mandatory.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Reads `.env` (if any) and the process environment.
    ///
    /// # Errors
    ///
    /// `ConfigError::LoadError` when the ledger section is missing or a value
    /// does not parse. Semantic checks are left to [`AppConfig::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Checks every section, stopping at the first problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.ledger.validate()?;
        self.engine.validate()?;
        self.telemetry.validate()
    }

    pub fn is_live(&self) -> bool {
        self.ledger.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Env vars are process-wide; serialise the tests that touch them.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "ENTITLE__LEDGER__API_KEY",
        "ENTITLE__LEDGER__BASE_URL",
        "ENTITLE__ENGINE__CACHE_CAPACITY",
        "ENTITLE__ENGINE__USAGE_DEADLINE_MS",
        "ENTITLE__TELEMETRY__FORMAT",
    ];

    /// Loads with exactly `vars` set, restoring a clean environment after.
    fn load_with(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        for name in VARS {
            env::remove_var(name);
        }
        for (name, value) in vars {
            env::set_var(name, value);
        }
        let result = AppConfig::load();
        for name in VARS {
            env::remove_var(name);
        }
        result
    }

    #[test]
    fn test_load_with_only_api_key() {
        let config = load_with(&[("ENTITLE__LEDGER__API_KEY", "sk_test_xxx")]).unwrap();

        assert_eq!(config.ledger.api_key, "sk_test_xxx");
        assert_eq!(config.engine.cache_capacity, 100);
        assert_eq!(config.telemetry.format, LogFormat::Pretty);
        assert!(!config.is_live());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_overrides() {
        let config = load_with(&[
            ("ENTITLE__LEDGER__API_KEY", "sk_live_xxx"),
            ("ENTITLE__LEDGER__BASE_URL", "http://localhost:12111"),
            ("ENTITLE__ENGINE__CACHE_CAPACITY", "500"),
            ("ENTITLE__ENGINE__USAGE_DEADLINE_MS", "750"),
            ("ENTITLE__TELEMETRY__FORMAT", "json"),
        ])
        .unwrap();

        assert!(config.is_live());
        assert_eq!(config.ledger.base_url.as_deref(), Some("http://localhost:12111"));
        assert_eq!(config.engine.cache_capacity, 500);
        assert_eq!(config.engine.usage_deadline_ms, 750);
        assert_eq!(config.engine.push_workers_live, 20);
        assert_eq!(config.telemetry.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_ledger_section_fails_to_load() {
        assert!(matches!(load_with(&[]), Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_bad_key_loads_but_fails_validation() {
        let config = load_with(&[("ENTITLE__LEDGER__API_KEY", "pk_test_xxx")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidLedgerKey)
        ));
    }
}
