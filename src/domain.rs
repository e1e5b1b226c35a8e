//! Core domain types shared across components.

use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// How a server's `launch_spec` is interpreted by the Adapter Framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
        }
    }
}

/// Transport-specific data needed to bring a server online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub kind: TransportKind,
    /// Stdio: the command to execute. Unused for Http.
    #[serde(default)]
    pub command: Option<String>,
    /// Stdio: ordered argument list.
    #[serde(default)]
    pub args: Vec<String>,
    /// Stdio: environment overlay merged onto the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Http: the server's base URL.
    #[serde(default)]
    pub url: Option<String>,
}

/// A registered MCP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub launch_spec: LaunchSpec,
    pub capabilities: HashSet<String>,
    pub tags: HashSet<String>,
    pub display_name: String,
    pub description: String,
}

/// A tool advertised by a server upon introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// A first-class capability entity, referenced by many servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: Option<String>,
}

/// The four health states of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Offline,
    Error,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Online => "online",
            HealthStatus::Offline => "offline",
            HealthStatus::Error => "error",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// One health snapshot per server, updated by the Health Monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_probe_at: Option<SystemTime>,
    pub last_success_at: Option<SystemTime>,
    pub consecutive_errors: u32,
    pub ewma_response_time: Option<f64>,
}

impl HealthSnapshot {
    /// A freshly registered server with no probes yet.
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_probe_at: None,
            last_success_at: None,
            consecutive_errors: 0,
            ewma_response_time: None,
        }
    }

    /// Fold a new probe measurement into this snapshot, per the Registry's
    /// health update algorithm (§4.2).
    pub fn apply_probe(&mut self, status: HealthStatus, response_time: Option<f64>, now: SystemTime) {
        if status == HealthStatus::Online {
            self.consecutive_errors = 0;
            self.last_success_at = Some(now);
            if let Some(t) = response_time {
                self.ewma_response_time = Some(crate::ewma::fold(self.ewma_response_time, t));
            }
        } else {
            self.consecutive_errors += 1;
        }
        self.status = status;
        self.last_probe_at = Some(now);
    }
}

/// An append-only record of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub server_id: String,
    pub tool_name: String,
    pub started_at: SystemTime,
    pub duration_s: f64,
    pub succeeded: bool,
}

/// A monotonic-clock counterpart to [`UsageRecord::started_at`], used where a
/// wall-clock instant would be vulnerable to clock adjustments (probe
/// deadlines, backoff timers). Kept separate from the persisted record,
/// which needs a `SystemTime` to serialize.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);
