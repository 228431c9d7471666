//! Environment setup pipeline
//!
//! Materializes a code+dependency image on a fresh volume: write modules via
//! helper workers (contents on stdin, never in command strings), fix
//! ownership for the runtime user, cache dependencies with the network
//! briefly enabled, then persist the record. Any failure after volume
//! creation rolls the volume back.

use crate::orchestrator::Orchestrator;
use crate::runtime::{Mount, NetworkMode, WorkerExit, WorkerSpec, WorkerStream};
use crate::VOLUME_PREFIX;
use chrono::Utc;
use tee_common::validate::validate_setup;
use tee_common::{Dependencies, Environment, Result, RuntimeKind, SetupRequest, TeeError};
use uuid::Uuid;

const HELPER_IMAGE: &str = "busybox:latest";
const RUNTIME_UID_GID: &str = "1000:1000";

impl Orchestrator {
    /// Prepare a new environment from user modules and dependencies.
    pub async fn setup(&self, req: SetupRequest) -> Result<Environment> {
        validate_setup(&req)?;

        let _permit = self.setup_queue.acquire().await?;

        let env_id = Uuid::new_v4();
        let volume_name = format!("{VOLUME_PREFIX}{env_id}");
        let runtime_kind = req.runtime.unwrap_or_default();

        tracing::debug!(
            environment_id = %env_id,
            volume_name = %volume_name,
            main_module = %req.main_module,
            runtime = %runtime_kind,
            module_count = req.modules.len(),
            "starting environment setup"
        );

        self.runtime
            .create_volume(&volume_name)
            .await
            .map_err(|e| TeeError::SetupFailed(format!("failed to create volume: {e}")))?;

        match self
            .populate_and_persist(env_id, &volume_name, runtime_kind, &req)
            .await
        {
            Ok(env) => Ok(env),
            Err(e) => {
                if let Err(rm_err) = self.runtime.remove_volume(&volume_name).await {
                    tracing::warn!(
                        volume_name = %volume_name,
                        error = %rm_err,
                        "failed to remove volume during setup rollback"
                    );
                }
                Err(e)
            }
        }
    }

    async fn populate_and_persist(
        &self,
        env_id: Uuid,
        volume_name: &str,
        runtime_kind: RuntimeKind,
        req: &SetupRequest,
    ) -> Result<Environment> {
        for (filename, content) in &req.modules {
            self.write_module(volume_name, filename, content).await?;
        }

        self.chown_workspace(volume_name).await;

        let dep_count = req.dependencies.as_ref().map_or(0, Dependencies::count);
        if let Some(deps) = req.dependencies.as_ref().filter(|d| !d.is_empty()) {
            tracing::info!(
                environment_id = %env_id,
                runtime = %runtime_kind,
                npm_count = deps.npm.len(),
                deno_count = deps.deno.len(),
                "installing dependencies"
            );
            self.install_dependencies(volume_name, deps, runtime_kind)
                .await?;
            tracing::info!(environment_id = %env_id, "dependencies installed");
        }

        let ttl_seconds = req
            .ttl_seconds
            .filter(|ttl| *ttl > 0)
            .unwrap_or(self.config.default_ttl_seconds);

        let metadata = serde_json::json!({
            "permissions": req.permissions,
            "moduleCount": req.modules.len(),
            "dependencyCount": dep_count,
            "hasDependencies": dep_count > 0,
            "runtime": runtime_kind.as_str(),
        });

        let env = Environment {
            id: env_id,
            volume_name: volume_name.to_string(),
            main_module: req.main_module.clone(),
            runtime: runtime_kind,
            created_at: Utc::now(),
            last_executed_at: None,
            execution_count: 0,
            status: "ready".to_string(),
            metadata,
            ttl_seconds,
        };

        self.store
            .insert_environment(&env)
            .await
            .map_err(|e| TeeError::SetupFailed(format!("failed to store environment: {e}")))?;

        tracing::info!(
            environment_id = %env_id,
            volume_name = %volume_name,
            main_module = %env.main_module,
            runtime = %runtime_kind,
            module_count = req.modules.len(),
            dependency_count = dep_count,
            ttl_seconds,
            "environment setup completed"
        );
        Ok(env)
    }

    /// Write one module file. The filename has passed validation, so it is
    /// safe inside the shell string; the content only ever travels stdin.
    async fn write_module(&self, volume_name: &str, filename: &str, content: &str) -> Result<()> {
        tracing::debug!(filename, content_length = content.len(), "writing module to volume");

        let write_cmd = format!("cat > /workspace/{filename}");
        let spec = WorkerSpec::new(HELPER_IMAGE)
            .with_mount(Mount::read_write(volume_name, "/workspace"))
            .with_args(["sh", "-c", write_cmd.as_str()])
            .with_stdin(content);

        let stream = self
            .runtime
            .run_worker(spec)
            .await
            .map_err(|e| TeeError::SetupFailed(format!("failed to write {filename}: {e}")))?;
        let (exit, stderr) = await_helper(stream).await?;
        if exit.exit_code != 0 {
            return Err(TeeError::SetupFailed(format!(
                "failed to write {filename}: {stderr}"
            )));
        }
        Ok(())
    }

    /// The runtime images run as uid 1000; ownership failures are tolerated
    /// since module reads may still work.
    async fn chown_workspace(&self, volume_name: &str) {
        let chown_cmd = format!("chown -R {RUNTIME_UID_GID} /workspace");
        let spec = WorkerSpec::new(HELPER_IMAGE)
            .with_mount(Mount::read_write(volume_name, "/workspace"))
            .with_args(["sh", "-c", chown_cmd.as_str()]);

        let failure = match self.runtime.run_worker(spec).await {
            Ok(stream) => match await_helper(stream).await {
                Ok((exit, stderr)) if exit.exit_code != 0 => {
                    Some(format!("exit {}: {stderr}", exit.exit_code))
                }
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };
        if let Some(detail) = failure {
            tracing::warn!(volume_name, error = %detail, "failed to set volume ownership");
        }
    }

    async fn install_dependencies(
        &self,
        volume_name: &str,
        deps: &Dependencies,
        runtime_kind: RuntimeKind,
    ) -> Result<()> {
        match runtime_kind {
            RuntimeKind::Bun => {
                if !deps.deno.is_empty() {
                    tracing::warn!(
                        modules = ?deps.deno,
                        "deno dependencies are not supported in bun runtime, ignoring"
                    );
                }
                for pkg in &deps.npm {
                    tracing::info!(package = %pkg, "installing npm package");
                    let spec = WorkerSpec::new(self.config.images.bun.clone())
                        .with_network(NetworkMode::Bridge)
                        .with_mount(Mount::read_write(volume_name, "/workspace"))
                        .with_workdir("/workspace")
                        .with_args(["add", pkg.as_str()]);
                    self.run_install_worker(spec, pkg).await?;
                }
            }
            RuntimeKind::Deno => {
                for pkg in &deps.npm {
                    tracing::info!(package = %pkg, "caching npm package");
                    let npm_spec = format!("npm:{pkg}");
                    let spec = self
                        .deno_install_spec(volume_name)
                        .with_args(["cache", "--node-modules-dir", npm_spec.as_str()]);
                    self.run_install_worker(spec, pkg).await?;
                }
                for url in &deps.deno {
                    tracing::info!(url = %url, "caching deno module");
                    let spec = self
                        .deno_install_spec(volume_name)
                        .with_args(["cache", url.as_str()]);
                    self.run_install_worker(spec, url).await?;
                }
            }
        }
        Ok(())
    }

    fn deno_install_spec(&self, volume_name: &str) -> WorkerSpec {
        // The cache lands on the environment volume itself so it is present,
        // read-only, at execute time.
        WorkerSpec::new(self.config.images.deno.clone())
            .with_network(NetworkMode::Bridge)
            .with_mount(Mount::read_write(volume_name, "/workspace"))
            .with_mount(Mount::read_write(volume_name, "/deno-dir"))
            .with_env("DENO_DIR", "/deno-dir")
            .with_workdir("/workspace")
    }

    async fn run_install_worker(&self, spec: WorkerSpec, specifier: &str) -> Result<()> {
        let stream = self.runtime.run_worker(spec).await.map_err(|e| {
            TeeError::SetupFailed(format!("failed to install {specifier}: {e}"))
        })?;
        let (exit, stdout, stderr) = await_install(stream).await?;
        if exit.exit_code != 0 {
            let output = if stderr.is_empty() { stdout } else { stderr };
            return Err(TeeError::SetupFailed(format!(
                "failed to install {specifier}: exit {} - output: {output}",
                exit.exit_code
            )));
        }
        Ok(())
    }
}

/// Consume a helper worker's streams quietly and wait for its exit.
async fn await_helper(stream: WorkerStream) -> Result<(WorkerExit, String)> {
    let WorkerStream {
        mut stdout,
        mut stderr,
        exit,
    } = stream;
    let drain = tokio::spawn(async move { while stdout.recv().await.is_some() {} });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        while let Some(line) = stderr.recv().await {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&line);
        }
        buf
    });

    let exit = exit
        .await
        .map_err(|_| TeeError::Runtime("worker exited without reporting status".to_string()))?;
    let _ = drain.await;
    let stderr_buf = stderr_task.await.unwrap_or_default();
    Ok((exit, stderr_buf))
}

/// Consume an install worker's streams, logging every line live.
async fn await_install(stream: WorkerStream) -> Result<(WorkerExit, String, String)> {
    let WorkerStream {
        mut stdout,
        mut stderr,
        exit,
    } = stream;
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        while let Some(line) = stdout.recv().await {
            if !line.is_empty() {
                tracing::info!(stream = "stdout", output = %line, "dependency install");
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&line);
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        while let Some(line) = stderr.recv().await {
            if !line.is_empty() {
                tracing::info!(stream = "stderr", output = %line, "dependency install");
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&line);
        }
        buf
    });

    let exit = exit
        .await
        .map_err(|_| TeeError::Runtime("worker exited without reporting status".to_string()))?;
    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();
    Ok((exit, stdout_buf, stderr_buf))
}
