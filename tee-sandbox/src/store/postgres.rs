//! Postgres-backed store

use super::{ExecutionRecord, ExpiredEnvironment, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use std::time::Duration;
use tee_common::{Environment, Result, RuntimeKind, TeeError};
use uuid::Uuid;

const CONNECT_ATTEMPTS: u32 = 30;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS environments (
    id UUID PRIMARY KEY,
    volume_name VARCHAR(255) NOT NULL UNIQUE,
    main_module VARCHAR(255) NOT NULL,
    runtime VARCHAR(50),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_executed_at TIMESTAMPTZ,
    execution_count INTEGER NOT NULL DEFAULT 0,
    status VARCHAR(50) NOT NULL DEFAULT 'ready',
    metadata JSONB,
    ttl_seconds INTEGER DEFAULT 3600
);

CREATE INDEX IF NOT EXISTS idx_environments_created_at ON environments(created_at);
CREATE INDEX IF NOT EXISTS idx_environments_last_executed_at ON environments(last_executed_at);
CREATE INDEX IF NOT EXISTS idx_environments_status ON environments(status);

CREATE TABLE IF NOT EXISTS executions (
    id UUID PRIMARY KEY,
    environment_id UUID NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    exit_code INTEGER,
    stdout TEXT,
    stderr TEXT,
    duration_ms BIGINT
);

CREATE INDEX IF NOT EXISTS idx_executions_environment_id ON executions(environment_id);
CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at);
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with retries; database containers often come up after us.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(300))
            .connect_lazy(database_url)?;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => {
                    tracing::info!(attempts = attempt, "database connection established");
                    return Ok(Self { pool });
                }
                Err(e) if attempt == CONNECT_ATTEMPTS => {
                    tracing::error!(error = %e, "failed to connect to database after retries");
                    return Err(TeeError::Database(e));
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "database ping failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        unreachable!("connect loop always returns")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the two tables and their indices if absent.
    pub async fn init_schema(&self) -> Result<()> {
        tracing::info!("initializing database schema");
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }
}

fn environment_from_row(row: &PgRow) -> std::result::Result<Environment, sqlx::Error> {
    let runtime: Option<String> = row.try_get("runtime")?;
    Ok(Environment {
        id: row.try_get("id")?,
        volume_name: row.try_get("volume_name")?,
        main_module: row.try_get("main_module")?,
        runtime: runtime
            .unwrap_or_default()
            .parse::<RuntimeKind>()
            .unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        last_executed_at: row.try_get("last_executed_at")?,
        execution_count: row.try_get("execution_count")?,
        status: row.try_get("status")?,
        metadata: row
            .try_get::<Option<serde_json::Value>, _>("metadata")?
            .unwrap_or(serde_json::Value::Null),
        ttl_seconds: row.try_get("ttl_seconds")?,
    })
}

const ENVIRONMENT_COLUMNS: &str = "id, volume_name, main_module, runtime, created_at, \
     last_executed_at, execution_count, status, metadata, ttl_seconds";

#[async_trait]
impl Store for PgStore {
    async fn insert_environment(&self, env: &Environment) -> Result<()> {
        sqlx::query(
            "INSERT INTO environments \
             (id, volume_name, main_module, runtime, created_at, last_executed_at, \
              execution_count, status, metadata, ttl_seconds) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(env.id)
        .bind(&env.volume_name)
        .bind(&env.main_module)
        .bind(env.runtime.as_str())
        .bind(env.created_at)
        .bind(env.last_executed_at)
        .bind(env.execution_count)
        .bind(&env.status)
        .bind(&env.metadata)
        .bind(env.ttl_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ready(&self, id: Uuid) -> Result<Option<Environment>> {
        let row = sqlx::query(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = $1 AND status = 'ready'"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(environment_from_row).transpose().map_err(Into::into)
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(environment_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn volume_name(&self, id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query("SELECT volume_name FROM environments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("volume_name")))
    }

    async fn delete_environment(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM environments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions \
             (id, environment_id, started_at, completed_at, exit_code, stdout, stderr, duration_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.environment_id)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.exit_code)
        .bind(&record.stdout)
        .bind(&record.stderr)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_execution_stats(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE environments \
             SET execution_count = execution_count + 1, last_executed_at = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expired_environments(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredEnvironment>> {
        let rows = sqlx::query(
            "SELECT id, volume_name, created_at, ttl_seconds FROM environments \
             WHERE created_at + (ttl_seconds || ' seconds')::interval < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ExpiredEnvironment {
                id: row.get("id"),
                volume_name: row.get("volume_name"),
                created_at: row.get("created_at"),
                ttl_seconds: row.get("ttl_seconds"),
            })
            .collect())
    }

    async fn environment_volumes(&self) -> Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query("SELECT id, volume_name FROM environments")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("volume_name")))
            .collect())
    }
}
