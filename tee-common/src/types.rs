//! Core types for environments and executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use uuid::Uuid;

/// Script runtime backing an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Deno,
    Bun,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deno => "deno",
            Self::Bun => "bun",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bun" => Ok(Self::Bun),
            // Empty means the record predates the runtime column.
            "deno" | "" => Ok(Self::Deno),
            other => Err(format!("unknown runtime: {other}")),
        }
    }
}

/// Durable record of a prepared sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    pub volume_name: String,
    pub main_module: String,
    pub runtime: RuntimeKind,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    pub execution_count: i32,
    pub status: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    pub ttl_seconds: i32,
}

/// Dependency specifiers to pre-cache on the environment's volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    /// npm package specs: `["pkg@version"]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub npm: Vec<String>,
    /// deno module URLs: `["https://..."]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deno: Vec<String>,
}

impl Dependencies {
    pub fn count(&self) -> usize {
        self.npm.len() + self.deno.len()
    }

    pub fn is_empty(&self) -> bool {
        self.npm.is_empty() && self.deno.is_empty()
    }
}

/// A declarative permission value: denied, granted in full, or granted for a
/// list of named items. Deserializes from JSON `false`, `true`, or a string
/// array respectively; this is the single canonical representation used both
/// when storing permissions and when evaluating them at execute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionGrant {
    Denied,
    All,
    List(Vec<String>),
}

impl Serialize for PermissionGrant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Denied => serializer.serialize_bool(false),
            Self::All => serializer.serialize_bool(true),
            Self::List(items) => items.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PermissionGrant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            List(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Self::All,
            Raw::Flag(false) => Self::Denied,
            Raw::List(items) => Self::List(items),
        })
    }
}

/// Declarative sandbox permissions, stored verbatim in environment metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_net: Option<PermissionGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_read: Option<PermissionGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<PermissionGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_env: Option<PermissionGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_run: Option<PermissionGrant>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_ffi: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_hrtime: bool,
}

/// Request to prepare a new environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    #[serde(default)]
    pub main_module: String,
    #[serde(default)]
    pub modules: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Dependencies>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeKind>,
}

/// Per-request resource limit overrides. Only positive values override the
/// defaults; everything is clamped to the configured hard caps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// Request to run the environment's handler once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
}

/// Point-in-time result of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_grant_from_bool() {
        let grant: PermissionGrant = serde_json::from_str("true").unwrap();
        assert_eq!(grant, PermissionGrant::All);
        let grant: PermissionGrant = serde_json::from_str("false").unwrap();
        assert_eq!(grant, PermissionGrant::Denied);
    }

    #[test]
    fn permission_grant_from_list() {
        let grant: PermissionGrant = serde_json::from_str(r#"["HOME", "PATH"]"#).unwrap();
        assert_eq!(
            grant,
            PermissionGrant::List(vec!["HOME".to_string(), "PATH".to_string()])
        );
    }

    #[test]
    fn permission_grant_roundtrip() {
        let grant = PermissionGrant::List(vec!["api.example.com".to_string()]);
        let json = serde_json::to_string(&grant).unwrap();
        assert_eq!(json, r#"["api.example.com"]"#);
        assert_eq!(serde_json::from_str::<PermissionGrant>(&json).unwrap(), grant);
    }

    #[test]
    fn permissions_absent_fields_stay_absent() {
        let perms: Permissions = serde_json::from_str(r#"{"allowEnv": ["HOME"]}"#).unwrap();
        assert!(perms.allow_net.is_none());
        assert_eq!(
            perms.allow_env,
            Some(PermissionGrant::List(vec!["HOME".to_string()]))
        );
        let json = serde_json::to_string(&perms).unwrap();
        assert_eq!(json, r#"{"allowEnv":["HOME"]}"#);
    }

    #[test]
    fn setup_request_wire_names() {
        let req: SetupRequest = serde_json::from_str(
            r#"{"mainModule": "main.ts", "modules": {"main.ts": "export {}"}, "ttlSeconds": 60}"#,
        )
        .unwrap();
        assert_eq!(req.main_module, "main.ts");
        assert_eq!(req.ttl_seconds, Some(60));
        assert!(req.runtime.is_none());
    }

    #[test]
    fn runtime_kind_parses_legacy_empty() {
        assert_eq!("".parse::<RuntimeKind>().unwrap(), RuntimeKind::Deno);
        assert_eq!("bun".parse::<RuntimeKind>().unwrap(), RuntimeKind::Bun);
        assert!("node".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn execution_response_wire_names() {
        let resp = ExecutionResponse {
            id: Uuid::nil(),
            exit_code: 124,
            stdout: String::new(),
            stderr: "Execution timeout exceeded".to_string(),
            duration_ms: 512,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["exitCode"], 124);
        assert_eq!(json["durationMs"], 512);
    }
}
