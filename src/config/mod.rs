//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::db::{PostgresDriverConfig, validate_identifier};
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub queue_table: String,
    pub queue_schema: Option<String>,
    pub cdc_schema: String,
    pub max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let queue_table = optional_var("QUEUE_TABLE").unwrap_or_else(|| "message_queue".into());
        validate_identifier("table", &queue_table)?;

        let queue_schema = optional_var("QUEUE_SCHEMA");
        if let Some(ref schema) = queue_schema {
            validate_identifier("schema", schema)?;
        }

        let cdc_schema = optional_var("CDC_SCHEMA").unwrap_or_else(|| "public".into());
        validate_identifier("schema", &cdc_schema)?;

        let max_connections = match optional_var("DB_MAX_CONNECTIONS") {
            Some(raw) => raw.parse().map_err(|_| {
                Error::Config(format!("DB_MAX_CONNECTIONS is not a number: {raw:?}"))
            })?,
            None => PostgresDriverConfig::default().max_connections,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            queue_table,
            queue_schema,
            cdc_schema,
            max_connections,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Queue driver settings derived from this config.
    pub fn driver_config(&self) -> PostgresDriverConfig {
        PostgresDriverConfig {
            schema: self.queue_schema.clone(),
            table: self.queue_table.clone(),
            max_connections: self.max_connections,
            ..PostgresDriverConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are treated alike.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
