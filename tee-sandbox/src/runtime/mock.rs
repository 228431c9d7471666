//! In-memory runtime for tests: tracks volumes, records every worker spec,
//! and replays scripted worker output.

use super::{ContainerRuntime, Isolation, WorkerExit, WorkerSpec, WorkerStream, TIMEOUT_EXIT_CODE};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tee_common::{Result, TeeError};
use tokio::sync::{mpsc, oneshot};

/// Scripted behavior for one worker invocation.
#[derive(Debug, Clone)]
pub struct MockWorker {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl MockWorker {
    pub fn success() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            timed_out: false,
            duration_ms: 5,
        }
    }

    pub fn with_stdout(line: impl Into<String>) -> Self {
        let mut worker = Self::success();
        worker.stdout.push(line.into());
        worker
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        let mut worker = Self::success();
        worker.exit_code = exit_code;
        worker.stderr.push(stderr.into());
        worker
    }

    pub fn timeout() -> Self {
        let mut worker = Self::success();
        worker.exit_code = TIMEOUT_EXIT_CODE;
        worker.timed_out = true;
        worker
    }
}

type WorkerScript = Box<dyn Fn(&WorkerSpec) -> Result<MockWorker> + Send + Sync>;

pub struct MockRuntime {
    isolation: Isolation,
    volumes: Mutex<HashSet<String>>,
    specs: Mutex<Vec<WorkerSpec>>,
    script: WorkerScript,
    fail_create_volume: Mutex<bool>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Every worker succeeds with no output.
    pub fn new() -> Self {
        Self::scripted(|_| Ok(MockWorker::success()))
    }

    /// Workers behave per the supplied script, which sees the full spec.
    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(&WorkerSpec) -> Result<MockWorker> + Send + Sync + 'static,
    {
        Self {
            isolation: Isolation::Hard,
            volumes: Mutex::new(HashSet::new()),
            specs: Mutex::new(Vec::new()),
            script: Box::new(script),
            fail_create_volume: Mutex::new(false),
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn fail_create_volume(&self) {
        *self.fail_create_volume.lock().unwrap() = true;
    }

    pub fn seed_volume(&self, name: &str) {
        self.volumes.lock().unwrap().insert(name.to_string());
    }

    pub fn volume_exists(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().unwrap().len()
    }

    /// Every `WorkerSpec` passed to `run_worker`, in call order.
    pub fn recorded_specs(&self) -> Vec<WorkerSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_volume(&self, name: &str) -> Result<()> {
        if *self.fail_create_volume.lock().unwrap() {
            return Err(TeeError::Runtime("volume creation refused".to_string()));
        }
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        Ok(self.volumes.lock().unwrap().iter().cloned().collect())
    }

    async fn run_worker(&self, spec: WorkerSpec) -> Result<WorkerStream> {
        let worker = (self.script)(&spec)?;
        self.specs.lock().unwrap().push(spec);

        let (stdout_tx, stdout_rx) = mpsc::channel(128);
        let (stderr_tx, stderr_rx) = mpsc::channel(128);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            for line in worker.stdout {
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
            for line in worker.stderr {
                if stderr_tx.send(line).await.is_err() {
                    break;
                }
            }
            drop(stdout_tx);
            drop(stderr_tx);
            let _ = exit_tx.send(WorkerExit {
                exit_code: worker.exit_code,
                duration_ms: worker.duration_ms,
                timed_out: worker.timed_out,
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
