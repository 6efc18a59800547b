//! Postgres hash store for change data capture.
//!
//! The source query must return `object_id` and `hash` columns. Hashes are
//! computed in the database over the fields whose changes matter, e.g.
//! `md5(row(name, email)::text)`, so columns nobody cares about never
//! trigger an update.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::validate_identifier;
use crate::cdc::HashStore;
use crate::error::Result;
use crate::model::cdc::{Change, ChangeKind};

/// Hash store comparing a live source query against `{schema}.cdc_hash`.
#[derive(Clone)]
pub struct PgHashStore {
    pool: PgPool,
    schema: String,
    source_query: String,
}

impl PgHashStore {
    pub fn new(
        pool: PgPool,
        schema: impl Into<String>,
        source_query: impl Into<String>,
    ) -> Result<Self> {
        let schema = schema.into();
        validate_identifier("schema", &schema)?;
        Ok(Self {
            pool,
            schema,
            source_query: source_query.into(),
        })
    }

    /// Create the hash table if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        let schema = &self.schema;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {schema}.cdc_hash (
                controller_id UUID NOT NULL,
                object_id     TEXT NOT NULL,
                hash          TEXT NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT cdc_hash_controller_object_uq UNIQUE (controller_id, object_id)
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recorded `(object_id, hash)` pairs for a controller.
    pub async fn recorded(&self, controller_id: Uuid) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT object_id, hash FROM {}.cdc_hash WHERE controller_id = $1 ORDER BY object_id",
            self.schema
        ))
        .bind(controller_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl HashStore for PgHashStore {
    async fn diff(&self, controller_id: Uuid, limit: usize) -> Result<Vec<Change>> {
        // Persisted rows are narrowed to this controller before the join, so
        // other controllers' hashes never surface as deletes.
        let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
            "WITH current AS (
                {source}
            ),
            persisted AS (
                SELECT object_id, hash FROM {schema}.cdc_hash WHERE controller_id = $1
            )
            SELECT
                COALESCE(c.object_id::text, p.object_id) AS object_id,
                CASE
                    WHEN p.object_id IS NULL THEN 'CREATE'
                    WHEN c.object_id IS NULL THEN 'DELETE'
                    ELSE 'UPDATE'
                END AS kind,
                COALESCE(c.hash::text, p.hash) AS hash
            FROM persisted p
            FULL OUTER JOIN current c ON c.object_id::text = p.object_id
            WHERE p.object_id IS NULL
               OR c.object_id IS NULL
               OR p.hash IS DISTINCT FROM c.hash::text
            ORDER BY random()
            LIMIT $2",
            source = self.source_query,
            schema = self.schema,
        ))
        .bind(controller_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(object_id, kind, hash)| {
                Ok(Change {
                    controller_id,
                    object_id,
                    hash,
                    kind: kind.parse::<ChangeKind>()?,
                })
            })
            .collect()
    }

    async fn upsert(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.cdc_hash (controller_id, object_id, hash)
             VALUES ($1, $2, $3)
             ON CONFLICT ON CONSTRAINT cdc_hash_controller_object_uq DO
             UPDATE SET hash = EXCLUDED.hash, updated_at = now()",
            self.schema
        ))
        .bind(controller_id)
        .bind(object_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {}.cdc_hash WHERE controller_id = $1 AND object_id = $2 AND hash = $3",
            self.schema
        ))
        .bind(controller_id)
        .bind(object_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
