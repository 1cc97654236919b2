//! Handle to a started container.

use crate::error::{CoreError, Result};
use crate::state::{LifecycleState, StateMachine};
use berth_engine::ContainerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Identifier plus cached network metadata of one container.
///
/// Owned by its [`LifecycleController`](crate::LifecycleController) and read
/// by wait strategies during the readiness phase. The lifecycle state is
/// live: it reflects stops and unexpected exits after the handle was made.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    id: ContainerId,
    image: String,
    host: String,
    exposed_ports: Vec<u16>,
    ports: BTreeMap<u16, u16>,
    started_at: DateTime<Utc>,
    state: StateMachine,
}

impl ContainerHandle {
    /// Create a handle.
    pub fn new(
        id: ContainerId,
        image: impl Into<String>,
        host: impl Into<String>,
        exposed_ports: Vec<u16>,
        ports: BTreeMap<u16, u16>,
        state: StateMachine,
    ) -> Self {
        Self {
            id,
            image: image.into(),
            host: host.into(),
            exposed_ports,
            ports,
            started_at: Utc::now(),
            state,
        }
    }

    /// Container identifier.
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Image the container runs.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Host at which published ports are reachable.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ports the container was asked to expose, in request order.
    pub fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    /// Exposed container port -> published host port.
    pub fn ports(&self) -> &BTreeMap<u16, u16> {
        &self.ports
    }

    /// When the engine reported the container started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }

    /// Host port published for container `port`.
    pub fn mapped_port(&self, port: u16) -> Result<u16> {
        self.ports.get(&port).copied().ok_or_else(|| {
            CoreError::precondition(format!(
                "container port {port} is not published for {}",
                self.id.short()
            ))
        })
    }

    /// Externally reachable `(host, port)` for container `port`.
    pub fn endpoint(&self, port: u16) -> Result<(String, u16)> {
        Ok((self.host.clone(), self.mapped_port(port)?))
    }

    /// Serializable snapshot, e.g. for printing.
    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            id: self.id.to_string(),
            image: self.image.clone(),
            host: self.host.clone(),
            ports: self.ports.clone(),
            state: self.state(),
            started_at: self.started_at,
        }
    }
}

/// Point-in-time view of a [`ContainerHandle`].
#[derive(Debug, Clone, Serialize)]
pub struct HandleSummary {
    /// Full container identifier.
    pub id: String,
    /// Image the container runs.
    pub image: String,
    /// Host to connect to.
    pub host: String,
    /// Container port to published host port.
    pub ports: BTreeMap<u16, u16>,
    /// Lifecycle state when the summary was taken.
    pub state: LifecycleState,
    /// When the engine reported the container started.
    pub started_at: DateTime<Utc>,
}
