//! Runtime configuration.
//!
//! Layers, lowest precedence first:
//! 1. Defaults in code
//! 2. `config/<environment>.toml` (optional)
//! 3. `STOCKLEDGER__*` environment variables, e.g. `STOCKLEDGER__STORE__BACKEND=postgres`

use std::time::Duration;

use config::{ConfigError, Environment, File, Map};
use serde::Deserialize;

use crate::dispatcher::RetryPolicy;

const ENV_PREFIX: &str = "STOCKLEDGER";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub environment: String,
    pub store: StoreSettings,
    pub dispatch: DispatchSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Required for the Postgres backend.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub operation_timeout_ms: u64,
}

impl DispatchSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub filter: String,
    pub json: bool,
}

impl Settings {
    /// Load from `.env`, config files and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let environment = std::env::var(format!("{ENV_PREFIX}__ENVIRONMENT"))
            .unwrap_or_else(|_| "development".into());
        Self::build(&environment, None)
    }

    /// Load with an explicit variable map standing in for the process
    /// environment.
    pub fn from_vars(environment: &str, vars: Map<String, String>) -> Result<Self, ConfigError> {
        Self::build(environment, Some(vars))
    }

    fn build(environment: &str, vars: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let defaults = RetryPolicy::default();
        let settings: Settings = config::Config::builder()
            .set_default("environment", environment)?
            .set_default("store.backend", "memory")?
            .set_default("store.max_connections", 10)?
            .set_default("dispatch.max_attempts", i64::from(defaults.max_attempts))?
            .set_default("dispatch.backoff_ms", defaults.backoff.as_millis() as i64)?
            .set_default(
                "dispatch.operation_timeout_ms",
                defaults.operation_timeout.as_millis() as i64,
            )?
            .set_default("logging.filter", "info")?
            .set_default("logging.json", true)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Postgres
            && self
                .store
                .database_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            return Err(ConfigError::Message(
                "store.database_url is required for the postgres backend".into(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Message(
                "store.max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
