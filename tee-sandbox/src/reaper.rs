//! TTL reaper and boot reconciliation
//!
//! The reaper evicts environments past their TTL on a fixed tick.
//! Reconciliation runs once at boot and converges the store and the volume
//! set in both directions: rows without volumes are dropped, prefixed
//! volumes without rows are removed.

use crate::runtime::ContainerRuntime;
use crate::store::Store;
use crate::VOLUME_PREFIX;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tee_common::Result;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub reaped: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub deleted_missing: usize,
    pub removed_orphans: usize,
}

pub struct Reaper {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            interval,
        }
    }

    /// Start the periodic eviction task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!(interval_secs = self.interval.as_secs(), "reaper service started");
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            loop {
                ticker.tick().await;
                self.reap_expired(Utc::now()).await;
            }
        })
    }

    /// Evict every environment whose TTL has elapsed as of `now`.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> ReapSummary {
        tracing::debug!("running environment reaper");

        let expired = match self.store.expired_environments(now).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!(error = %e, "reaper query failed");
                return ReapSummary::default();
            }
        };

        let mut summary = ReapSummary::default();
        for env in expired {
            let age_seconds = (now - env.created_at).num_seconds();
            tracing::info!(
                environment_id = %env.id,
                volume_name = %env.volume_name,
                age_seconds,
                ttl_seconds = env.ttl_seconds,
                "reaping expired environment"
            );

            // Row first: a half-finished reap leaves an orphaned volume for
            // reconciliation, never a record pointing at nothing.
            if let Err(e) = self.store.delete_environment(env.id).await {
                tracing::error!(
                    environment_id = %env.id,
                    error = %e,
                    "failed to delete environment during reap"
                );
                summary.errors += 1;
                continue;
            }
            if let Err(e) = self.runtime.remove_volume(&env.volume_name).await {
                tracing::warn!(
                    volume_name = %env.volume_name,
                    error = %e,
                    "failed to remove volume during reap"
                );
            }
            summary.reaped += 1;
        }

        if summary.reaped > 0 || summary.errors > 0 {
            tracing::info!(
                reaped = summary.reaped,
                errors = summary.errors,
                "reaper cycle completed"
            );
        } else {
            tracing::debug!("reaper cycle completed - no expired environments");
        }
        summary
    }

    /// Converge store and volume set. Idempotent; runs before traffic.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        tracing::info!("starting environment reconciliation");

        let volumes: HashSet<String> = self.runtime.list_volumes().await?.into_iter().collect();
        tracing::debug!(count = volumes.len(), "found backend volumes");

        let rows = self.store.environment_volumes().await?;
        let row_volumes: HashSet<&str> = rows.iter().map(|(_, name)| name.as_str()).collect();

        let mut summary = ReconcileSummary::default();

        for (id, volume_name) in &rows {
            if !volumes.contains(volume_name) {
                tracing::warn!(
                    environment_id = %id,
                    volume_name = %volume_name,
                    "volume missing for environment - deleting record"
                );
                match self.store.delete_environment(*id).await {
                    Ok(()) => summary.deleted_missing += 1,
                    Err(e) => {
                        tracing::error!(
                            environment_id = %id,
                            error = %e,
                            "failed to delete environment with missing volume"
                        );
                    }
                }
            }
        }

        for volume_name in &volumes {
            if volume_name.starts_with(VOLUME_PREFIX) && !row_volumes.contains(volume_name.as_str())
            {
                tracing::warn!(volume_name = %volume_name, "removing orphaned volume");
                match self.runtime.remove_volume(volume_name).await {
                    Ok(()) => summary.removed_orphans += 1,
                    Err(e) => {
                        tracing::error!(
                            volume_name = %volume_name,
                            error = %e,
                            "failed to remove orphaned volume"
                        );
                    }
                }
            }
        }

        tracing::info!(
            deleted_missing_volumes = summary.deleted_missing,
            removed_orphaned_volumes = summary.removed_orphans,
            "reconciliation completed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use tee_common::{Environment, RuntimeKind};
    use uuid::Uuid;

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

    fn reaper(store: Arc<MemoryStore>, runtime: Arc<MockRuntime>) -> Reaper {
        Reaper::new(store, runtime, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn reaps_expired_environments_only() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());
        let now = Utc::now();

        let expired = environment(60, now - ChronoDuration::seconds(120));
        let fresh = environment(3600, now);
        for env in [&expired, &fresh] {
            store.insert_environment(env).await.unwrap();
            runtime.seed_volume(&env.volume_name);
        }

        let summary = reaper(store.clone(), runtime.clone()).reap_expired(now).await;
        assert_eq!(summary, ReapSummary { reaped: 1, errors: 0 });
        assert!(store.environment(expired.id).await.is_none());
        assert!(!runtime.volume_exists(&expired.volume_name));
        assert!(store.environment(fresh.id).await.is_some());
        assert!(runtime.volume_exists(&fresh.volume_name));
    }

    #[tokio::test]
    async fn reconcile_removes_orphaned_volumes_and_rows() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());
        let now = Utc::now();

        // Healthy pair.
        let healthy = environment(3600, now);
        store.insert_environment(&healthy).await.unwrap();
        runtime.seed_volume(&healthy.volume_name);

        // Row whose volume vanished.
        let rowless_volume = environment(3600, now);
        store.insert_environment(&rowless_volume).await.unwrap();

        // Volume from a crashed setup, plus a foreign volume to leave alone.
        let orphan = format!("tee-env-{}", Uuid::new_v4());
        runtime.seed_volume(&orphan);
        runtime.seed_volume("postgres-data");

        let reaper = reaper(store.clone(), runtime.clone());
        let summary = reaper.reconcile().await.unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                deleted_missing: 1,
                removed_orphans: 1,
            }
        );
        assert!(store.environment(healthy.id).await.is_some());
        assert!(store.environment(rowless_volume.id).await.is_none());
        assert!(!runtime.volume_exists(&orphan));
        assert!(runtime.volume_exists("postgres-data"));
        assert!(runtime.volume_exists(&healthy.volume_name));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());

        let healthy = environment(3600, Utc::now());
        store.insert_environment(&healthy).await.unwrap();
        runtime.seed_volume(&healthy.volume_name);
        runtime.seed_volume(&format!("tee-env-{}", Uuid::new_v4()));

        let reaper = reaper(store.clone(), runtime.clone());
        let first = reaper.reconcile().await.unwrap();
        assert_eq!(first.removed_orphans, 1);

        let second = reaper.reconcile().await.unwrap();
        assert_eq!(second, ReconcileSummary::default());
        assert!(store.environment(healthy.id).await.is_some());
    }
}
