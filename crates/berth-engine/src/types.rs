//! Values exchanged with a container engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Engine-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wrap an identifier returned by the engine.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 12 characters, as shown by `docker ps`.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Process status of a container as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started.
    Created,
    /// Main process is running.
    Running,
    /// Frozen by the engine.
    Paused,
    /// Being restarted by a restart policy.
    Restarting,
    /// Removal in progress.
    Removing,
    /// Main process has exited.
    Exited,
    /// Engine gave up on the container.
    Dead,
    /// Status the engine did not report or that berth does not know.
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// True once the main process is gone for good.
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead | Self::Removing)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of the engine's own healthcheck for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The image defines no healthcheck.
    #[default]
    None,
    /// Healthcheck has not passed yet.
    Starting,
    /// Healthcheck passed.
    Healthy,
    /// Healthcheck failed past its retry budget.
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Snapshot of a container returned by [`EngineClient::inspect`](crate::EngineClient::inspect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspection {
    /// Container identifier.
    pub id: ContainerId,
    /// Process status.
    pub status: ContainerStatus,
    /// Exit code, once the process has exited.
    pub exit_code: Option<i64>,
    /// Engine healthcheck result.
    pub health: HealthState,
    /// Killed by the kernel OOM killer.
    pub oom_killed: bool,
    /// Engine-side error message, if any.
    pub error: Option<String>,
    /// Exposed container port -> published host port.
    pub ports: BTreeMap<u16, u16>,
}

impl ContainerInspection {
    /// Inspection of a container in the given status with nothing else known.
    pub fn new(id: ContainerId, status: ContainerStatus) -> Self {
        Self {
            id,
            status,
            exit_code: None,
            health: HealthState::None,
            oom_killed: false,
            error: None,
            ports: BTreeMap::new(),
        }
    }

    /// True if the main process is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code of the command (-1 if the engine did not report one).
    pub exit_code: i64,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
