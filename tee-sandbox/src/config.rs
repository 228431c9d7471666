//! Core configuration, passed in by the top-level wiring.

use tee_common::RuntimeKind;

/// Worker images per runtime kind.
#[derive(Debug, Clone)]
pub struct RuntimeImages {
    pub deno: String,
    pub bun: String,
}

impl Default for RuntimeImages {
    fn default() -> Self {
        Self {
            deno: "octaviusdeployment/assist-tee-rt-deno:latest".to_string(),
            bun: "octaviusdeployment/assist-tee-rt-bun:latest".to_string(),
        }
    }
}

impl RuntimeImages {
    pub fn for_runtime(&self, runtime: RuntimeKind) -> &str {
        match runtime {
            RuntimeKind::Deno => &self.deno,
            RuntimeKind::Bun => &self.bun,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Setup admission queue capacity.
    pub setup_concurrency: usize,
    /// Execution admission queue capacity.
    pub execute_concurrency: usize,
    /// Hard cap on per-execution timeout.
    pub max_timeout_ms: u64,
    /// Hard cap on per-execution memory.
    pub max_memory_mb: u64,
    /// TTL applied when a setup request does not specify one.
    pub default_ttl_seconds: i32,
    pub images: RuntimeImages,
    /// When set, a non-empty `allowNet` permission switches execution workers
    /// from no network to bridge networking with the recorded allow-list.
    /// The default posture stays deny-all.
    pub allow_net_enables_bridge: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            setup_concurrency: 10,
            execute_concurrency: 50,
            max_timeout_ms: 60_000,
            max_memory_mb: 512,
            default_ttl_seconds: 3600,
            images: RuntimeImages::default(),
            allow_net_enables_bridge: false,
        }
    }
}
