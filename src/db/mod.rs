//! Database connection pool and Postgres-backed storage.
//!
//! One pool is shared by the queue driver and the CDC hash store.

pub mod cdc;
pub mod queue;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use cdc::PgHashStore;
pub use queue::{PostgresDriver, PostgresDriverConfig};

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Health check: run a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Reject anything but plain SQL identifiers. Table and schema names are
/// spliced into statements, so they cannot be bound as parameters.
pub fn validate_identifier(kind: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && ident.len() <= 63 {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid {kind} name: {ident:?}")))
    }
}

/// `schema.table`, or just `table` when no schema is set.
pub(crate) fn qualified(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{schema}.{table}"),
        _ => table.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("table", "message_queue").is_ok());
        assert!(validate_identifier("table", "_q2").is_ok());
        assert!(validate_identifier("table", "").is_err());
        assert!(validate_identifier("table", "2queue").is_err());
        assert!(validate_identifier("table", "queue; DROP TABLE x").is_err());
        assert!(validate_identifier("schema", "public.queue").is_err());
    }

    #[test]
    fn qualified_name_skips_empty_schema() {
        assert_eq!(qualified(None, "q"), "q");
        assert_eq!(qualified(Some(""), "q"), "q");
        assert_eq!(qualified(Some("ops"), "q"), "ops.q");
    }
}
