//! Core types for the instance registry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Running => f.write_str("running"),
            InstanceStatus::Stopped => f.write_str("stopped"),
            InstanceStatus::Error => f.write_str("error"),
        }
    }
}

/// Who launched the tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchSource {
    /// Spawned by this gateway run.
    Gateway,
    /// The gateway process itself.
    #[serde(rename = "self")]
    Itself,
    /// Attached to a process launched elsewhere.
    External,
}

/// How the gateway talks to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Stdio,
    InProcess,
}

/// Point-in-time resource usage of a live process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub uptime_secs: u64,
}

/// Tool surface discovered from a connected backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub tool_count: usize,
    pub tool_names: Vec<String>,
}

/// Display metadata attached to an instance record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    /// Kind of instance, e.g. "backend" or "gateway".
    #[serde(default)]
    pub kind: String,

    /// Filter tokens active when the instance was launched.
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// One tracked process: a backend child or the gateway itself.
///
/// `id` is unique and stable for the instance's lifetime. `pid` is `None`
/// until process identity is discovered; a running instance with an
/// unknown pid is not treated as dead before the stale grace window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub pid: Option<u32>,
    pub backend_name: String,
    pub launch_source: LaunchSource,
    pub started_at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub resource_usage: Option<ResourceUsage>,
    pub context: ContextInfo,
    pub connection_type: ConnectionType,
    pub config_snapshot: serde_json::Value,
    pub capabilities: Option<CapabilitySummary>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Change notification published by the registry on every mutation.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Instance),
    Removed { id: String },
    StatusChanged { id: String, status: InstanceStatus },
    Updated(Instance),
    CollectionChanged,
}
