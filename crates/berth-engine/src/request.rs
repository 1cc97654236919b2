//! Builder pattern for container creation requests.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Image reference, e.g. `redis:7-alpine`.
    pub image: String,
    /// Optional container name (engine generates one otherwise).
    pub name: Option<String>,
    /// Command overriding the image default; empty keeps the default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container TCP ports to publish on random host ports.
    pub exposed_ports: Vec<u16>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Pull the image first if it is not present locally (default: true).
    pub pull_if_missing: bool,
}

impl ContainerRequest {
    /// Create a new request builder for `image`.
    pub fn builder(image: impl Into<String>) -> ContainerRequestBuilder {
        ContainerRequestBuilder::new(image)
    }

    /// Validate the request.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(EngineError::InvalidRequest("image is required".into()));
        }
        if self.exposed_ports.contains(&0) {
            return Err(EngineError::InvalidRequest(
                "exposed port 0 is not a valid port".into(),
            ));
        }
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(EngineError::InvalidRequest(
                    "container name must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Environment in `KEY=value` form.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Fluent builder for [`ContainerRequest`].
///
/// # Example
///
/// ```
/// use berth_engine::ContainerRequest;
///
/// let request = ContainerRequest::builder("redis:7-alpine")
///     .expose(6379)
///     .env("REDIS_ARGS", "--save ''")
///     .build()
///     .unwrap();
/// assert_eq!(request.exposed_ports, vec![6379]);
/// ```
#[derive(Debug, Clone)]
pub struct ContainerRequestBuilder {
    request: ContainerRequest,
}

impl ContainerRequestBuilder {
    fn new(image: impl Into<String>) -> Self {
        Self {
            request: ContainerRequest {
                image: image.into(),
                name: None,
                command: Vec::new(),
                env: BTreeMap::new(),
                exposed_ports: Vec::new(),
                labels: BTreeMap::new(),
                pull_if_missing: true,
            },
        }
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.request.name = Some(name.into());
        self
    }

    /// Override the image command.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.env.insert(key.into(), value.into());
        self
    }

    /// Expose a container TCP port. Duplicates are ignored.
    pub fn expose(mut self, port: u16) -> Self {
        if !self.request.exposed_ports.contains(&port) {
            self.request.exposed_ports.push(port);
        }
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.labels.insert(key.into(), value.into());
        self
    }

    /// Never pull; fail if the image is missing locally.
    pub fn no_pull(mut self) -> Self {
        self.request.pull_if_missing = false;
        self
    }

    /// Build the request, validating all fields.
    pub fn build(self) -> Result<ContainerRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}
