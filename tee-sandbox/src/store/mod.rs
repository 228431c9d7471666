//! Metadata store abstraction
//!
//! Persistence of environment and execution records. All durable state lives
//! here and on the container backend's volumes; the two are reconciled at
//! boot and by the reaper.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tee_common::{Environment, Result};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One completed invocation. Inserted after the fact, never updated.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

/// An environment past its TTL, as seen by the reaper.
#[derive(Debug, Clone)]
pub struct ExpiredEnvironment {
    pub id: Uuid,
    pub volume_name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i32,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_environment(&self, env: &Environment) -> Result<()>;

    /// Load an environment only if its status is `ready`.
    async fn get_ready(&self, id: Uuid) -> Result<Option<Environment>>;

    /// All environments, newest first.
    async fn list_environments(&self) -> Result<Vec<Environment>>;

    /// Volume name for an environment regardless of status.
    async fn volume_name(&self, id: Uuid) -> Result<Option<String>>;

    /// Delete an environment row; executions cascade.
    async fn delete_environment(&self, id: Uuid) -> Result<()>;

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Bump `execution_count` and stamp `last_executed_at`.
    async fn record_execution_stats(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Environments whose `created_at + ttl` lies before `now`.
    async fn expired_environments(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredEnvironment>>;

    /// `(id, volume_name)` for every environment row.
    async fn environment_volumes(&self) -> Result<Vec<(Uuid, String)>>;
}
