//! Docker-backed runtime

use super::{
    ContainerRuntime, Isolation, MountMode, NetworkMode, WorkerExit, WorkerSpec, WorkerStream,
    TIMEOUT_EXIT_CODE,
};
use async_trait::async_trait;
use std::process::Stdio;
use tee_common::{Result, TeeError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

const GVISOR_RUNTIME_FLAG: &str = "--runtime=runsc";
const LINE_CHANNEL_CAPACITY: usize = 128;

/// Runs volumes and workers through the `docker` CLI. Workers are started
/// with `--rm` and killed at their deadline, so nothing outlives a call.
pub struct DockerRuntime {
    isolation: Isolation,
}

impl DockerRuntime {
    pub fn new(isolation: Isolation) -> Self {
        Self { isolation }
    }

    fn run_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];

        if self.isolation == Isolation::Hard {
            args.push(GVISOR_RUNTIME_FLAG.to_string());
        }

        args.push(format!("--network={}", spec.network.as_str()));
        if let Some(user) = &spec.user {
            args.push(format!("--user={user}"));
        }
        if spec.read_only_root {
            args.push("--read-only".to_string());
        }
        if let Some(memory) = spec.memory_bytes {
            args.push(format!("--memory={memory}b"));
        }
        if let Some(cpus) = spec.cpu_quota {
            args.push(format!("--cpus={cpus}"));
        }
        if let Some(pids) = spec.pids_max {
            args.push(format!("--pids-limit={pids}"));
        }
        for mount in &spec.mounts {
            let suffix = match mount.mode {
                MountMode::ReadOnly => ":ro",
                MountMode::ReadWrite => "",
            };
            args.push("-v".to_string());
            args.push(format!("{}:{}{}", mount.volume, mount.path, suffix));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        let mut extra_entrypoint_args = Vec::new();
        if let Some(entrypoint) = &spec.entrypoint_override {
            if let Some((first, rest)) = entrypoint.split_first() {
                args.push("--entrypoint".to_string());
                args.push(first.clone());
                extra_entrypoint_args = rest.to_vec();
            }
        }

        args.push(spec.image.clone());
        args.extend(extra_entrypoint_args);
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_volume(&self, name: &str) -> Result<()> {
        let output = Command::new("docker")
            .args(["volume", "create", name])
            .output()
            .await
            .map_err(|e| TeeError::Runtime(format!("failed to run docker: {e}")))?;
        if !output.status.success() {
            return Err(TeeError::Runtime(format!(
                "failed to create volume {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        // -f makes removal of a missing volume succeed.
        let output = Command::new("docker")
            .args(["volume", "rm", "-f", name])
            .output()
            .await
            .map_err(|e| TeeError::Runtime(format!("failed to run docker: {e}")))?;
        if !output.status.success() {
            return Err(TeeError::Runtime(format!(
                "failed to remove volume {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let output = Command::new("docker")
            .args(["volume", "ls", "--format", "{{.Name}}"])
            .output()
            .await
            .map_err(|e| TeeError::Runtime(format!("failed to run docker: {e}")))?;
        if !output.status.success() {
            return Err(TeeError::Runtime(format!(
                "failed to list volumes: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn run_worker(&self, spec: WorkerSpec) -> Result<WorkerStream> {
        let args = self.run_args(&spec);

        let mut command = Command::new("docker");
        command
            .args(&args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| TeeError::Runtime(format!("failed to spawn worker: {e}")))?;

        if let Some(input) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(input.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let (stdout_tx, stdout_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    // Keep draining the pipe even after the receiver is gone,
                    // otherwise the worker blocks on a full pipe.
                    let _ = stdout_tx.send(line).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = stderr_tx.send(line).await;
                }
            });
        }

        let deadline = spec.deadline;
        tokio::spawn(async move {
            let start = std::time::Instant::now();
            let mut timed_out = false;

            let status = if let Some(deadline) = deadline {
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        let _ = child.kill().await;
                        timed_out = true;
                        child.wait().await
                    }
                }
            } else {
                child.wait().await
            };

            let exit_code = if timed_out {
                TIMEOUT_EXIT_CODE
            } else {
                match status {
                    Ok(status) => status.code().unwrap_or(1),
                    Err(_) => 1,
                }
            };

            let _ = exit_tx.send(WorkerExit {
                exit_code,
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out,
            });
        });

        Ok(WorkerStream {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
        })
    }

    fn isolation(&self) -> Isolation {
        self.isolation
    }
}
