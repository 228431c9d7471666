//! Execution pipeline
//!
//! Spawns one ephemeral, resource-capped worker per invocation against the
//! environment's read-only volume, feeds the input frame over stdin, streams
//! both output channels into the log while capturing them, and parses the
//! wrapper's `{success, result, error}` frame from stdout.

use crate::config::CoreConfig;
use crate::orchestrator::Orchestrator;
use crate::policy;
use crate::runtime::{Isolation, Mount, WorkerSpec, WorkerStream, TIMEOUT_EXIT_CODE};
use crate::store::ExecutionRecord;
use chrono::Utc;
use serde::Deserialize;
use tee_common::{
    ExecuteRequest, ExecutionResponse, Permissions, ResourceLimits, Result, RuntimeKind, TeeError,
};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MEMORY_MB: u64 = 128;
const EXECUTION_USER: &str = "1000:1000";
const EXECUTION_PIDS_MAX: u32 = 100;
const EXECUTION_CPU_QUOTA: f64 = 0.5;

/// Captured stream buffers stop growing past this; logging continues.
const MAX_CAPTURE_BYTES: usize = 1 << 20;

/// The one structured frame the in-sandbox wrapper writes to stdout.
/// Missing fields default, so a bare `{}` parses; anything that is not a
/// JSON object fails open and the raw stdout becomes the result.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkerFrame {
    success: bool,
    result: serde_json::Value,
    error: Option<String>,
}

impl Orchestrator {
    /// Run the environment's handler once.
    pub async fn execute(
        &self,
        env_id: Uuid,
        req: ExecuteRequest,
    ) -> Result<ExecutionResponse> {
        let _permit = self.execute_queue.acquire().await?;

        let env = self
            .store
            .get_ready(env_id)
            .await?
            .ok_or(TeeError::NotFound)?;

        let (timeout_ms, memory_mb) = effective_limits(req.limits.as_ref(), &self.config);
        let exec_id = Uuid::new_v4();

        let permissions: Option<Permissions> = env
            .metadata
            .get("permissions")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok());
        let exposure = policy::evaluate_env(permissions.as_ref(), &req.env);
        let net = policy::evaluate_net(permissions.as_ref(), self.config.allow_net_enables_bridge);

        let input = serde_json::json!({
            "event": {
                "data": req.data,
                "env": req.env,
            },
            "context": {
                "executionId": exec_id,
                "environmentId": env_id,
                "requestId": exec_id,
            },
            "mainModule": env.main_module,
        });
        let frame = serde_json::to_string(&input)?;

        tracing::debug!(
            environment_id = %env_id,
            execution_id = %exec_id,
            volume_name = %env.volume_name,
            main_module = %env.main_module,
            runtime = %env.runtime,
            timeout_ms,
            memory_mb,
            "starting container execution"
        );

        let mut spec = WorkerSpec::new(self.config.images.for_runtime(env.runtime))
            .with_mount(Mount::read_only(&env.volume_name, "/workspace"))
            .with_stdin(frame);
        spec.network = net.network;
        spec.read_only_root = true;
        spec.user = Some(EXECUTION_USER.to_string());
        spec.memory_bytes = Some(memory_mb * 1024 * 1024);
        spec.cpu_quota = Some(EXECUTION_CPU_QUOTA);
        spec.pids_max = Some(EXECUTION_PIDS_MAX);
        spec.deadline = Some(Instant::now() + Duration::from_millis(timeout_ms));

        match env.runtime {
            RuntimeKind::Deno => {
                spec = spec
                    .with_mount(Mount::read_only(&env.volume_name, "/deno-dir"))
                    .with_env("DENO_DIR", "/deno-dir");
                if let Some(allowed) = exposure.allowed_env_value() {
                    spec = spec.with_env("ALLOWED_ENV_VARS", allowed);
                }
            }
            RuntimeKind::Bun => {
                spec = spec.with_mount(Mount::read_only(&env.volume_name, "/home/bun/.bun"));
            }
        }
        if let Some(hosts) = &net.allow_list {
            spec = spec.with_env("ALLOWED_NET", hosts.join(","));
        }

        if self.runtime.isolation() == Isolation::Relaxed {
            tracing::warn!(
                environment_id = %env_id,
                execution_id = %exec_id,
                "isolation is relaxed - execution is not kernel-sandboxed"
            );
        }

        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let stream = self
            .runtime
            .run_worker(spec)
            .await
            .map_err(|e| TeeError::ExecutionFailed(e.to_string()))?;

        let WorkerStream {
            stdout,
            stderr,
            exit,
        } = stream;
        let stdout_task = tokio::spawn(capture_lines(stdout, "stdout", env_id, exec_id));
        let stderr_task = tokio::spawn(capture_lines(stderr, "stderr", env_id, exec_id));

        let exit = exit.await.map_err(|_| {
            TeeError::ExecutionFailed("worker exited without reporting status".to_string())
        })?;
        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as i64;

        if exit.timed_out {
            tracing::warn!(
                environment_id = %env_id,
                execution_id = %exec_id,
                timeout_ms,
                duration_ms,
                "execution timeout exceeded"
            );
            return Ok(ExecutionResponse {
                id: exec_id,
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: "Execution timeout exceeded".to_string(),
                duration_ms,
            });
        }

        let mut exit_code = exit.exit_code;
        let (stdout_result, stderr_result) = match serde_json::from_str::<WorkerFrame>(&stdout_buf)
        {
            Ok(frame) if frame.success => (serde_json::to_string(&frame.result)?, stderr_buf),
            Ok(frame) => {
                if exit_code == 0 {
                    exit_code = 1;
                }
                (String::new(), frame.error.unwrap_or_default())
            }
            Err(_) => (stdout_buf, stderr_buf),
        };

        let record = ExecutionRecord {
            id: exec_id,
            environment_id: env_id,
            started_at,
            completed_at: Some(Utc::now()),
            exit_code,
            stdout: stdout_result.clone(),
            stderr: stderr_result.clone(),
            duration_ms,
        };
        if let Err(e) = self.store.insert_execution(&record).await {
            tracing::warn!(
                execution_id = %exec_id,
                error = %e,
                "failed to store execution record"
            );
        }
        if let Err(e) = self.store.record_execution_stats(env_id, Utc::now()).await {
            tracing::warn!(
                environment_id = %env_id,
                error = %e,
                "failed to update environment stats"
            );
        }

        tracing::info!(
            environment_id = %env_id,
            execution_id = %exec_id,
            exit_code,
            duration_ms,
            success = exit_code == 0,
            "execution completed"
        );

        Ok(ExecutionResponse {
            id: exec_id,
            exit_code,
            stdout: stdout_result,
            stderr: stderr_result,
            duration_ms,
        })
    }
}

fn effective_limits(limits: Option<&ResourceLimits>, config: &CoreConfig) -> (u64, u64) {
    let mut timeout_ms = DEFAULT_TIMEOUT_MS;
    let mut memory_mb = DEFAULT_MEMORY_MB;
    if let Some(limits) = limits {
        if let Some(t) = limits.timeout_ms.filter(|t| *t > 0) {
            timeout_ms = t;
        }
        if let Some(m) = limits.memory_mb.filter(|m| *m > 0) {
            memory_mb = m;
        }
    }
    (
        timeout_ms.min(config.max_timeout_ms),
        memory_mb.min(config.max_memory_mb),
    )
}

/// Log every complete line with its stream and ids, while accumulating a
/// bounded copy for result parsing.
async fn capture_lines(
    mut rx: mpsc::Receiver<String>,
    stream: &'static str,
    env_id: Uuid,
    exec_id: Uuid,
) -> String {
    let mut buffer = String::new();
    while let Some(line) = rx.recv().await {
        if !line.is_empty() {
            tracing::info!(
                env_id = %env_id,
                exec_id = %exec_id,
                stream,
                output = %line,
                "execution output"
            );
        }
        if buffer.len() + line.len() < MAX_CAPTURE_BYTES {
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(&line);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, MockWorker, MountMode, NetworkMode};
    use crate::store::{MemoryStore, Store};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tee_common::Environment;

    fn environment(metadata: serde_json::Value) -> Environment {
        let id = Uuid::new_v4();
        Environment {
            id,
            volume_name: format!("tee-env-{id}"),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at: Utc::now(),
            last_executed_at: None,
            execution_count: 0,
            status: "ready".to_string(),
            metadata,
            ttl_seconds: 3600,
        }
    }

    async fn seeded_orchestrator(
        runtime: Arc<MockRuntime>,
        env: &Environment,
    ) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_environment(env).await.unwrap();
        runtime.seed_volume(&env.volume_name);
        (
            Orchestrator::new(runtime, store.clone(), CoreConfig::default()),
            store,
        )
    }

    fn request(data: serde_json::Value) -> ExecuteRequest {
        ExecuteRequest {
            data: Some(data),
            env: HashMap::new(),
            limits: None,
        }
    }

    #[tokio::test]
    async fn success_frame_becomes_result_json() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":{"sum":8}}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, store) = seeded_orchestrator(runtime.clone(), &env).await;

        let resp = orch
            .execute(env.id, request(serde_json::json!({"a": 5, "b": 3})))
            .await
            .unwrap();

        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.stdout, r#"{"sum":8}"#);
        assert!(resp.stderr.is_empty());

        let records = store.execution_records(env.id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stdout, r#"{"sum":8}"#);
        let updated = store.environment(env.id).await.unwrap();
        assert_eq!(updated.execution_count, 1);
        assert!(updated.last_executed_at.is_some());
    }

    #[tokio::test]
    async fn worker_spec_locks_down_the_sandbox() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":null}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        orch.execute(env.id, request(serde_json::json!({})))
            .await
            .unwrap();

        let specs = runtime.recorded_specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.network, NetworkMode::None);
        assert!(spec.read_only_root);
        assert_eq!(spec.user.as_deref(), Some("1000:1000"));
        assert_eq!(spec.pids_max, Some(100));
        assert_eq!(spec.memory_bytes, Some(128 * 1024 * 1024));
        assert!(spec.deadline.is_some());
        assert!(spec
            .mounts
            .iter()
            .all(|m| m.mode == MountMode::ReadOnly));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.path == "/workspace" && m.volume == env.volume_name));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.path == "/deno-dir" && m.volume == env.volume_name));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "DENO_DIR" && v == "/deno-dir"));
    }

    #[tokio::test]
    async fn input_frame_reaches_the_worker_via_stdin() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":null}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        let mut req = request(serde_json::json!({"a": 1}));
        req.env.insert("REGION".to_string(), "eu".to_string());
        orch.execute(env.id, req).await.unwrap();

        let spec = &runtime.recorded_specs()[0];
        let frame: serde_json::Value =
            serde_json::from_str(spec.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(frame["event"]["data"]["a"], 1);
        assert_eq!(frame["event"]["env"]["REGION"], "eu");
        assert_eq!(frame["mainModule"], "main.ts");
        assert_eq!(frame["context"]["environmentId"], env.id.to_string());
        assert_eq!(frame["context"]["executionId"], frame["context"]["requestId"]);
    }

    #[tokio::test]
    async fn failure_frame_promotes_exit_code_and_moves_error_to_stderr() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":false,"error":"nope"}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        let resp = orch
            .execute(env.id, request(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.exit_code, 1);
        assert_eq!(resp.stderr, "nope");
        assert!(resp.stdout.is_empty());
    }

    #[tokio::test]
    async fn unparseable_stdout_fails_open_as_raw_result() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            let mut worker = MockWorker::with_stdout("plain text output");
            worker.stderr.push("some diagnostics".to_string());
            Ok(worker)
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        let resp = orch
            .execute(env.id, request(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.stdout, "plain text output");
        assert_eq!(resp.stderr, "some diagnostics");
    }

    #[tokio::test]
    async fn timeout_returns_sentinel_and_skips_persistence() {
        let runtime = Arc::new(MockRuntime::scripted(|_| Ok(MockWorker::timeout())));
        let env = environment(serde_json::Value::Null);
        let (orch, store) = seeded_orchestrator(runtime.clone(), &env).await;

        let mut req = request(serde_json::json!({}));
        req.limits = Some(ResourceLimits {
            timeout_ms: Some(500),
            memory_mb: None,
        });
        let resp = orch.execute(env.id, req).await.unwrap();

        assert_eq!(resp.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(resp.stderr, "Execution timeout exceeded");
        assert!(store.execution_records(env.id).await.is_empty());
        assert_eq!(store.environment(env.id).await.unwrap().execution_count, 0);
    }

    #[tokio::test]
    async fn unknown_environment_is_not_found() {
        let orch = Orchestrator::new(
            Arc::new(MockRuntime::new()),
            Arc::new(MemoryStore::new()),
            CoreConfig::default(),
        );
        let err = orch
            .execute(Uuid::new_v4(), request(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TeeError::NotFound));
    }

    #[tokio::test]
    async fn limits_are_clamped_to_hard_caps() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":null}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        let mut req = request(serde_json::json!({}));
        req.limits = Some(ResourceLimits {
            timeout_ms: Some(999_999),
            memory_mb: Some(4096),
        });
        orch.execute(env.id, req).await.unwrap();

        let spec = &runtime.recorded_specs()[0];
        assert_eq!(spec.memory_bytes, Some(512 * 1024 * 1024));
    }

    #[tokio::test]
    async fn env_allow_list_is_intersected_and_exported() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":null}"#))
        }));
        let metadata = serde_json::json!({
            "permissions": {
                "allowEnv": ["API_KEY", "REGION"],
            },
        });
        let env = environment(metadata);
        let (orch, _) = seeded_orchestrator(runtime.clone(), &env).await;

        let mut req = request(serde_json::json!({}));
        req.env.insert("REGION".to_string(), "eu".to_string());
        req.env.insert("SECRET".to_string(), "x".to_string());
        orch.execute(env.id, req).await.unwrap();

        let spec = &runtime.recorded_specs()[0];
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "ALLOWED_ENV_VARS" && v == "REGION"));
    }

    #[tokio::test]
    async fn store_failures_do_not_fail_the_caller() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":42}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, store) = seeded_orchestrator(runtime.clone(), &env).await;
        store.fail_execution_inserts();

        let resp = orch
            .execute(env.id, request(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.stdout, "42");
    }

    #[tokio::test]
    async fn concurrent_executions_both_count() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::with_stdout(r#"{"success":true,"result":1}"#))
        }));
        let env = environment(serde_json::Value::Null);
        let (orch, store) = seeded_orchestrator(runtime.clone(), &env).await;
        let orch = Arc::new(orch);

        let a = {
            let orch = orch.clone();
            let id = env.id;
            tokio::spawn(async move { orch.execute(id, request(serde_json::json!({}))).await })
        };
        let b = {
            let orch = orch.clone();
            let id = env.id;
            tokio::spawn(async move { orch.execute(id, request(serde_json::json!({}))).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(store.environment(env.id).await.unwrap().execution_count, 2);
        assert_eq!(store.execution_records(env.id).await.len(), 2);
    }

    #[test]
    fn effective_limits_overlay_and_clamp() {
        let config = CoreConfig::default();
        assert_eq!(effective_limits(None, &config), (5_000, 128));
        let limits = ResourceLimits {
            timeout_ms: Some(10_000),
            memory_mb: Some(256),
        };
        assert_eq!(effective_limits(Some(&limits), &config), (10_000, 256));
        let over = ResourceLimits {
            timeout_ms: Some(120_000),
            memory_mb: Some(2048),
        };
        assert_eq!(effective_limits(Some(&over), &config), (60_000, 512));
        let zeros = ResourceLimits {
            timeout_ms: Some(0),
            memory_mb: Some(0),
        };
        assert_eq!(effective_limits(Some(&zeros), &config), (5_000, 128));
    }
}
