//! Container runtime abstraction
//!
//! The only primitives the core assumes of its isolation backend: persistent
//! named volumes, and disposable workers with mounts, resource caps, a
//! network policy, and piped stdio.

mod docker;
mod mock;

use async_trait::async_trait;
use tee_common::Result;
use tokio::sync::{mpsc, oneshot};

pub use docker::DockerRuntime;
pub use mock::{MockRuntime, MockWorker};

/// Whether workers run under a kernel sandbox. `Relaxed` is for development
/// only and is warned about on every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Hard,
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// A volume mounted into a worker.
#[derive(Debug, Clone)]
pub struct Mount {
    pub volume: String,
    pub path: String,
    pub mode: MountMode,
}

impl Mount {
    pub fn read_only(volume: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            path: path.into(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(volume: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            path: path.into(),
            mode: MountMode::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    None,
    /// Only used while fetching dependencies at setup time, or when an
    /// explicit network allow-list policy is in effect.
    Bridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
        }
    }
}

/// Full configuration of one disposable worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub image: String,
    pub mounts: Vec<Mount>,
    pub network: NetworkMode,
    pub memory_bytes: Option<u64>,
    pub cpu_quota: Option<f64>,
    pub pids_max: Option<u32>,
    pub read_only_root: bool,
    /// `uid:gid` the worker runs as.
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub entrypoint_override: Option<Vec<String>>,
    pub args: Vec<String>,
    /// Streamed to the worker's stdin, then the stream is closed. Contents
    /// are never composed into command strings.
    pub stdin: Option<String>,
    /// Absolute wall time past which the adapter kills the worker and
    /// reports the sentinel exit 124.
    pub deadline: Option<tokio::time::Instant>,
}

impl WorkerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: Vec::new(),
            network: NetworkMode::None,
            memory_bytes: None,
            cpu_quota: None,
            pids_max: None,
            read_only_root: false,
            user: None,
            env: Vec::new(),
            workdir: None,
            entrypoint_override: None,
            args: Vec::new(),
            stdin: None,
            deadline: None,
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Terminal state of a worker.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Sentinel exit code reported when a worker is killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Live output of a running worker: line-oriented stdout and stderr, and the
/// final exit over a oneshot once the process is reaped.
pub struct WorkerStream {
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<WorkerExit>,
}

/// Container runtime capability.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create an empty named volume.
    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Remove a volume; a missing volume is not an error.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// All volume names currently known to the backend.
    async fn list_volumes(&self) -> Result<Vec<String>>;

    /// Spawn a disposable worker. The adapter owns process cleanup on every
    /// path, including deadline kills.
    async fn run_worker(&self, spec: WorkerSpec) -> Result<WorkerStream>;

    /// Which isolation mode workers actually get.
    fn isolation(&self) -> Isolation;
}
