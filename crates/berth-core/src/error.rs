//! Error types for berth-core.

use crate::state::LifecycleState;
use berth_engine::{ContainerId, EngineError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for berth-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Boxed cause carried through retry and launch failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while starting, waiting on or stopping a container.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Programmer error, never retried
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A bounded wait ran out of wall-clock time
    #[error("timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
        /// Last failure observed before the deadline, if any
        #[source]
        last_error: Option<BoxError>,
    },

    /// A bounded wait ran out of attempts
    #[error("gave up after {attempts} attempt(s)")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        #[source]
        last_error: Option<BoxError>,
    },

    /// Container never became ready, or the engine failed to launch it
    #[error(transparent)]
    Launch(#[from] LaunchFailure),

    /// Running container exited without a preceding stop
    #[error("container {container_id} exited unexpectedly{}", exit_suffix(.exit_code))]
    UnexpectedTermination {
        /// Container that exited
        container_id: ContainerId,
        /// Exit code, when the engine reported one
        exit_code: Option<i64>,
    },

    /// Error from the engine client
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Lifecycle state machine rejected a transition
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: LifecycleState,
        /// Requested state
        to: LifecycleState,
    },

    /// Work was submitted after the worker pool shut down
    #[error("worker pool has been shut down")]
    PoolShutdown,
}

fn exit_suffix(code: &Option<i64>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

impl CoreError {
    /// Shorthand for [`CoreError::Precondition`].
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Kind of the launch failure, if this is one.
    pub fn launch_kind(&self) -> Option<LaunchFailureKind> {
        match self {
            Self::Launch(failure) => Some(failure.kind),
            _ => None,
        }
    }

    /// True for [`CoreError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Why a container failed to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailureKind {
    /// The engine failed during create or start.
    Engine,
    /// A wait strategy exhausted its budget.
    NeverReady,
    /// The engine healthcheck reported the container unhealthy.
    Unhealthy,
    /// The container exited or died before it became ready.
    ExitedEarly,
    /// The outer deadline of a composite strategy expired.
    CompositeTimeout,
    /// Every startup attempt failed.
    AttemptsExhausted,
}

impl fmt::Display for LaunchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => write!(f, "engine failure"),
            Self::NeverReady => write!(f, "never became ready"),
            Self::Unhealthy => write!(f, "reported unhealthy"),
            Self::ExitedEarly => write!(f, "exited before becoming ready"),
            Self::CompositeTimeout => write!(f, "outer startup timeout expired"),
            Self::AttemptsExhausted => write!(f, "all startup attempts failed"),
        }
    }
}

/// Lifecycle-level launch failure with its originating cause.
#[derive(Debug, Error)]
#[error("container launch failed ({kind}): {message}")]
pub struct LaunchFailure {
    /// Failure category
    pub kind: LaunchFailureKind,
    /// What was probed and how long was waited
    pub message: String,
    /// Originating cause
    #[source]
    pub source: Option<BoxError>,
}

impl LaunchFailure {
    /// Create a launch failure without a cause.
    pub fn new(kind: LaunchFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the originating cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }
}
