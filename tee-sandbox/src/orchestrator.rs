//! Orchestrator facade
//!
//! Owns the container runtime, the store, and the two admission queues.
//! The setup and execute pipelines live in `builder` and `engine`.

use crate::admission::AdmissionQueue;
use crate::config::CoreConfig;
use crate::runtime::ContainerRuntime;
use crate::store::Store;
use std::sync::Arc;
use tee_common::{Environment, Result, TeeError};
use uuid::Uuid;

pub struct Orchestrator {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: CoreConfig,
    pub(crate) setup_queue: AdmissionQueue,
    pub(crate) execute_queue: AdmissionQueue,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: CoreConfig,
    ) -> Self {
        let setup_queue = AdmissionQueue::new(config.setup_concurrency);
        let execute_queue = AdmissionQueue::new(config.execute_concurrency);
        Self {
            runtime,
            store,
            config,
            setup_queue,
            execute_queue,
        }
    }

    /// All environments, newest first.
    pub async fn list(&self) -> Result<Vec<Environment>> {
        self.store.list_environments().await
    }

    /// Remove an environment's volume and record. Volume removal failures
    /// are logged; the record is deleted regardless and executions cascade.
    pub async fn delete(&self, env_id: Uuid) -> Result<()> {
        let volume_name = self
            .store
            .volume_name(env_id)
            .await?
            .ok_or(TeeError::NotFound)?;

        tracing::debug!(
            environment_id = %env_id,
            volume_name = %volume_name,
            "deleting environment"
        );

        if let Err(e) = self.runtime.remove_volume(&volume_name).await {
            tracing::warn!(
                volume_name = %volume_name,
                error = %e,
                "failed to remove volume"
            );
        }
        self.store.delete_environment(env_id).await?;

        tracing::info!(
            environment_id = %env_id,
            volume_name = %volume_name,
            "environment deleted"
        );
        Ok(())
    }

    /// Fail all queued and future setup/execute admissions with `Cancelled`.
    pub fn shutdown(&self) {
        self.setup_queue.close();
        self.execute_queue.close();
    }
}
