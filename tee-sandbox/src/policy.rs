//! Permission policy evaluation
//!
//! Permissions are stored declaratively in environment metadata; these pure
//! functions turn them into the concrete values the execution engine puts on
//! a worker spec.

use crate::runtime::NetworkMode;
use std::collections::HashMap;
use tee_common::{PermissionGrant, Permissions};

/// Value of `ALLOWED_ENV_VARS` when the allow-list intersection is empty;
/// the in-sandbox wrapper treats it as "expose nothing".
pub const NO_ENV_SENTINEL: &str = "__NONE__";

/// Which of the request's env vars the worker may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvExposure {
    /// No restriction recorded; the wrapper passes everything through.
    All,
    /// Only these keys (already intersected with the request's env).
    List(Vec<String>),
    /// Nothing is exposed.
    Nothing,
}

impl EnvExposure {
    /// The `ALLOWED_ENV_VARS` value to export, or `None` when unrestricted.
    pub fn allowed_env_value(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::List(keys) => Some(keys.join(",")),
            Self::Nothing => Some(NO_ENV_SENTINEL.to_string()),
        }
    }
}

/// Evaluate the recorded `allowEnv` grant against the env vars actually
/// passed with the request. Absent or `true` means unrestricted.
pub fn evaluate_env(
    permissions: Option<&Permissions>,
    request_env: &HashMap<String, String>,
) -> EnvExposure {
    let grant = match permissions.and_then(|p| p.allow_env.as_ref()) {
        None | Some(PermissionGrant::All) => return EnvExposure::All,
        Some(PermissionGrant::Denied) => return EnvExposure::Nothing,
        Some(PermissionGrant::List(keys)) => keys,
    };

    let mut allowed: Vec<String> = request_env
        .keys()
        .filter(|key| grant.contains(key))
        .cloned()
        .collect();
    if allowed.is_empty() {
        return EnvExposure::Nothing;
    }
    allowed.sort();
    EnvExposure::List(allowed)
}

/// Network posture for an execution worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDecision {
    pub network: NetworkMode,
    /// host[:port] allow-list exported to the wrapper when bridging.
    pub allow_list: Option<Vec<String>>,
}

impl NetworkDecision {
    fn denied() -> Self {
        Self {
            network: NetworkMode::None,
            allow_list: None,
        }
    }
}

/// Evaluate the recorded `allowNet` grant. The deny-all posture stands
/// unless the deployment opted in with `bridge_enabled`; whether an
/// allow-list loosens the default is the deployment's call, not ours.
pub fn evaluate_net(permissions: Option<&Permissions>, bridge_enabled: bool) -> NetworkDecision {
    if !bridge_enabled {
        return NetworkDecision::denied();
    }
    match permissions.and_then(|p| p.allow_net.as_ref()) {
        Some(PermissionGrant::List(hosts)) if !hosts.is_empty() => NetworkDecision {
            network: NetworkMode::Bridge,
            allow_list: Some(hosts.clone()),
        },
        _ => NetworkDecision::denied(),
    }
}
