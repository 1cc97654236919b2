//! Error types for berth-engine.

use crate::ContainerId;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request rejected before it reached the engine
    #[error("invalid container request: {0}")]
    InvalidRequest(String),

    /// Engine does not know the container
    #[error("container not found: {0}")]
    NotFound(ContainerId),

    /// Engine could not be reached
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Image could not be pulled
    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    /// Engine-side failure for one operation
    #[error("{operation} failed for container {container_id}: {reason}")]
    Operation {
        operation: &'static str,
        container_id: ContainerId,
        reason: String,
    },

    /// Docker Engine API error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl EngineError {
    /// Build an [`EngineError::Operation`].
    pub fn operation(
        operation: &'static str,
        container_id: &ContainerId,
        reason: impl Into<String>,
    ) -> Self {
        Self::Operation {
            operation,
            container_id: container_id.clone(),
            reason: reason.into(),
        }
    }
}
