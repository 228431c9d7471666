//! In-memory store for tests, with optional write-failure injection.

use super::{ExecutionRecord, ExpiredEnvironment, Store};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tee_common::{Environment, Result, TeeError};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    environments: HashMap<Uuid, Environment>,
    executions: HashMap<Uuid, Vec<ExecutionRecord>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_environment_inserts: AtomicBool,
    fail_execution_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `insert_environment` fail, for rollback tests.
    pub fn fail_environment_inserts(&self) {
        self.fail_environment_inserts.store(true, Ordering::SeqCst);
    }

    /// Make every `insert_execution` fail, for best-effort persistence tests.
    pub fn fail_execution_inserts(&self) {
        self.fail_execution_inserts.store(true, Ordering::SeqCst);
    }

    pub async fn environment(&self, id: Uuid) -> Option<Environment> {
        self.inner.read().await.environments.get(&id).cloned()
    }

    pub async fn environment_count(&self) -> usize {
        self.inner.read().await.environments.len()
    }

    pub async fn execution_records(&self, environment_id: Uuid) -> Vec<ExecutionRecord> {
        self.inner
            .read()
            .await
            .executions
            .get(&environment_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_environment(&self, env: &Environment) -> Result<()> {
        if self.fail_environment_inserts.load(Ordering::SeqCst) {
            return Err(TeeError::Internal("environment insert refused".to_string()));
        }
        self.inner
            .write()
            .await
            .environments
            .insert(env.id, env.clone());
        Ok(())
    }

    async fn get_ready(&self, id: Uuid) -> Result<Option<Environment>> {
        Ok(self
            .inner
            .read()
            .await
            .environments
            .get(&id)
            .filter(|env| env.status == "ready")
            .cloned())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        let mut envs: Vec<Environment> = self
            .inner
            .read()
            .await
            .environments
            .values()
            .cloned()
            .collect();
        envs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(envs)
    }

    async fn volume_name(&self, id: Uuid) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .environments
            .get(&id)
            .map(|env| env.volume_name.clone()))
    }

    async fn delete_environment(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.environments.remove(&id);
        // Cascade, as the foreign key would.
        inner.executions.remove(&id);
        Ok(())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        if self.fail_execution_inserts.load(Ordering::SeqCst) {
            return Err(TeeError::Internal("execution insert refused".to_string()));
        }
        self.inner
            .write()
            .await
            .executions
            .entry(record.environment_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn record_execution_stats(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(env) = self.inner.write().await.environments.get_mut(&id) {
            env.execution_count += 1;
            env.last_executed_at = Some(now);
        }
        Ok(())
    }

    async fn expired_environments(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredEnvironment>> {
        Ok(self
            .inner
            .read()
            .await
            .environments
            .values()
            .filter(|env| env.created_at + Duration::seconds(env.ttl_seconds as i64) < now)
            .map(|env| ExpiredEnvironment {
                id: env.id,
                volume_name: env.volume_name.clone(),
                created_at: env.created_at,
                ttl_seconds: env.ttl_seconds,
            })
            .collect())
    }

    async fn environment_volumes(&self) -> Result<Vec<(Uuid, String)>> {
        Ok(self
            .inner
            .read()
            .await
            .environments
            .values()
            .map(|env| (env.id, env.volume_name.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tee_common::RuntimeKind;

    fn environment(ttl_seconds: i32, created_at: DateTime<Utc>) -> Environment {
        let id = Uuid::new_v4();
        Environment {
            id,
            volume_name: format!("tee-env-{id}"),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at,
            last_executed_at: None,
            execution_count: 0,
            status: "ready".to_string(),
            metadata: serde_json::Value::Null,
            ttl_seconds,
        }
    }

    #[tokio::test]
    async fn delete_cascades_to_executions() {
        let store = MemoryStore::new();
        let env = environment(3600, Utc::now());
        store.insert_environment(&env).await.unwrap();
        store
            .insert_execution(&ExecutionRecord {
                id: Uuid::new_v4(),
                environment_id: env.id,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                exit_code: 0,
                stdout: "{}".to_string(),
                stderr: String::new(),
                duration_ms: 3,
            })
            .await
            .unwrap();

        store.delete_environment(env.id).await.unwrap();
        assert!(store.environment(env.id).await.is_none());
        assert!(store.execution_records(env.id).await.is_empty());
    }

    #[tokio::test]
    async fn expiry_is_ttl_relative_to_creation() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let expired = environment(60, now - Duration::seconds(120));
        let fresh = environment(3600, now);
        store.insert_environment(&expired).await.unwrap();
        store.insert_environment(&fresh).await.unwrap();

        let found = store.expired_environments(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, expired.id);
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let older = environment(3600, now - Duration::seconds(30));
        let newer = environment(3600, now);
        store.insert_environment(&older).await.unwrap();
        store.insert_environment(&newer).await.unwrap();

        let envs = store.list_environments().await.unwrap();
        assert_eq!(envs[0].id, newer.id);
        assert_eq!(envs[1].id, older.id);
    }
}
