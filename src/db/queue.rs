//! Postgres queue driver.
//!
//! The claim in `pop` is a single `UPDATE … FROM (SELECT … FOR UPDATE SKIP
//! LOCKED)` statement, so concurrent sync managers never claim one row twice.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Db, qualified, validate_identifier};
use crate::driver::{DEFAULT_LEASE_TIMEOUT, Driver, MSG_ATTEMPTING, MSG_CREATED};
use crate::error::{Error, Result};
use crate::model::task::{Task, TaskData, TaskId, TaskState, task_data_from_value};
use crate::telemetry::metrics;

/// Where the queue lives and how long a claim is honoured.
#[derive(Debug, Clone)]
pub struct PostgresDriverConfig {
    pub schema: Option<String>,
    pub table: String,
    pub lease_timeout: Duration,
    /// Pool size used by [`PostgresDriver::connect`].
    pub max_connections: u32,
}

impl Default for PostgresDriverConfig {
    fn default() -> Self {
        Self {
            schema: None,
            table: "message_queue".to_string(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_connections: 5,
        }
    }
}

/// Queue driver backed by a Postgres table.
#[derive(Clone)]
pub struct PostgresDriver {
    pool: PgPool,
    schema: Option<String>,
    table: String,
    lease_timeout: Duration,
}

impl PostgresDriver {
    pub fn new(pool: PgPool, config: PostgresDriverConfig) -> Result<Self> {
        validate_identifier("table", &config.table)?;
        if let Some(ref schema) = config.schema {
            validate_identifier("schema", schema)?;
        }
        Ok(Self {
            pool,
            schema: config.schema,
            table: config.table,
            lease_timeout: config.lease_timeout,
        })
    }

    /// Open a pool of `config.max_connections` and build a driver on it.
    pub async fn connect(url: &str, config: PostgresDriverConfig) -> Result<Self> {
        let db = Db::connect(url, config.max_connections).await?;
        Self::new(db.pool().clone(), config)
    }

    fn schema_table(&self) -> String {
        qualified(self.schema.as_deref(), &self.table)
    }

    fn primary_key(&self) -> String {
        format!("{}_id", self.table)
    }

    fn task_columns(&self) -> String {
        format!(
            "a.{} AS id, a.task_key, a.task_name, a.created_at, a.data, a.state, a.last_attempted, a.last_attempt_message, a.do_after",
            self.primary_key()
        )
    }

    /// Create the queue table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let table = self.schema_table();
        let pk = self.primary_key();

        if let Some(ref schema) = self.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await?;
        }

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {pk}                 UUID PRIMARY KEY,
                    task_key             TEXT NOT NULL,
                    task_name            TEXT NOT NULL,
                    created_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
                    data                 JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    state                TEXT NOT NULL DEFAULT 'READY',
                    last_attempted       TIMESTAMPTZ NOT NULL DEFAULT now(),
                    last_attempt_message TEXT,
                    do_after             TIMESTAMPTZ
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_claim_idx ON {table} (state, last_attempted)",
                self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_name_idx ON {table} (task_name, created_at DESC)",
                self.table
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_state(&self, id: TaskId) -> Result<Option<TaskState>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT state FROM {} WHERE {} = $1",
            self.schema_table(),
            self.primary_key()
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(state,)| state.parse()).transpose()
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "PostgresDriver"
    }

    async fn add_task(
        &self,
        name: &str,
        key: &str,
        not_before: Option<DateTime<Utc>>,
        data: TaskData,
    ) -> Result<TaskId> {
        let id = TaskId::new();
        sqlx::query(&format!(
            "INSERT INTO {} ({}, task_key, task_name, created_at, data, state, last_attempted, last_attempt_message, do_after)
             VALUES ($1, $2, $3, now(), $4, $5, now(), $6, $7)",
            self.schema_table(),
            self.primary_key()
        ))
        .bind(id.0)
        .bind(key)
        .bind(name)
        .bind(serde_json::Value::Object(data))
        .bind(TaskState::Ready.as_str())
        .bind(MSG_CREATED)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        metrics::tasks_enqueued().add(1, &[KeyValue::new("task_name", name.to_string())]);
        Ok(id)
    }

    async fn get_task(&self, name: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} a WHERE a.task_name = $1 ORDER BY a.created_at DESC LIMIT 1",
            self.task_columns(),
            self.schema_table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn pop(&self) -> Result<Option<Task>> {
        let table = self.schema_table();
        let pk = self.primary_key();

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "WITH next AS (
                SELECT {pk}
                FROM {table}
                WHERE (
                    state = $1
                    OR (
                        last_attempted < now() - make_interval(secs => $2)
                        AND state IN ($3, $4)
                    )
                )
                AND (do_after IS NULL OR do_after <= now())
                ORDER BY last_attempted ASC, created_at ASC, {pk} ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} a
            SET state = $3, last_attempted = now(), last_attempt_message = $5
            FROM next
            WHERE a.{pk} = next.{pk}
            RETURNING {}",
            self.task_columns()
        ))
        .bind(TaskState::Ready.as_str())
        .bind(self.lease_timeout.as_secs_f64())
        .bind(TaskState::InProgress.as_str())
        .bind(TaskState::Retry.as_str())
        .bind(MSG_ATTEMPTING)
        .fetch_optional(&self.pool)
        .await?;

        metrics::task_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if row.is_some() { "claimed" } else { "empty" },
            )],
        );

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn refresh_retry(&self, age: Duration) -> Result<u64> {
        let refreshed = sqlx::query(&format!(
            "UPDATE {} SET state = $1, last_attempted = now()
             WHERE state = $2 AND last_attempted <= now() - make_interval(secs => $3)",
            self.schema_table()
        ))
        .bind(TaskState::Ready.as_str())
        .bind(TaskState::Retry.as_str())
        .bind(age.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if refreshed > 0 {
            metrics::task_state_transitions()
                .add(refreshed, &[KeyValue::new("to", TaskState::Ready.as_str())]);
        }
        Ok(refreshed)
    }

    async fn transition(&self, id: TaskId, to: TaskState, message: &str) -> Result<()> {
        let sources: Vec<String> = TaskState::sources_of(to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let rows_affected = sqlx::query(&format!(
            "UPDATE {} SET state = $1, last_attempted = now(), last_attempt_message = $2
             WHERE {} = $3 AND state = ANY($4)",
            self.schema_table(),
            self.primary_key()
        ))
        .bind(to.as_str())
        .bind(message)
        .bind(id.0)
        .bind(&sources)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return match self.current_state(id).await? {
                None => Err(Error::NotFound(format!("task {id}"))),
                from => Err(Error::InvalidTransition { id, from, to }),
            };
        }

        metrics::task_state_transitions().add(1, &[KeyValue::new("to", to.as_str())]);
        Ok(())
    }

    async fn queue_length(&self) -> Result<i64> {
        let (length,): (i64,) =
            sqlx::query_as(&format!("SELECT count(*) FROM {}", self.schema_table()))
                .fetch_one(&self.pool)
                .await?;
        Ok(length)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {}", self.schema_table()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task_key: String,
    task_name: String,
    created_at: DateTime<Utc>,
    data: serde_json::Value,
    state: String,
    last_attempted: DateTime<Utc>,
    last_attempt_message: Option<String>,
    do_after: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            key: self.task_key,
            name: self.task_name,
            data: task_data_from_value(self.data)?,
            created_at: self.created_at,
            not_before: self.do_after,
            state: self.state.parse()?,
            last_attempted: self.last_attempted,
            last_attempt_message: self.last_attempt_message,
        })
    }
}
