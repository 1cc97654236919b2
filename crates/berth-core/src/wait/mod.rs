//! Readiness checks for started containers.
//!
//! A [`WaitStrategy`] decides when a started container is actually usable.
//! Every strategy carries its own startup timeout and, on exhausting it,
//! fails with a [`LaunchFailure`] naming what was probed and how long it
//! waited.
//!
//! | Strategy | Ready when |
//! |----------|------------|
//! | [`PortOpen`] | every configured port accepts a TCP connection |
//! | [`LogPattern`] | a regex matched the container output N times |
//! | [`HttpProbe`] | an HTTP request returns an accepted status (and body) |
//! | [`HealthCheck`] | the engine healthcheck reports healthy |
//! | [`ProcessExit`] | the container process exited |
//! | [`CommandSuccess`] | a command run inside the container exits 0 |
//! | [`CompositeWait`] | all children, in order |

mod command;
mod composite;
mod exit;
mod health;
mod http;
mod log;
mod port;

pub use command::CommandSuccess;
pub use composite::{CompositeWait, TimeoutMode};
pub use exit::ProcessExit;
pub use health::HealthCheck;
pub use http::HttpProbe;
pub use log::LogPattern;
pub use port::PortOpen;

use crate::error::{CoreError, LaunchFailure, LaunchFailureKind, Result};
use crate::handle::ContainerHandle;
use async_trait::async_trait;
use berth_engine::{ContainerId, EngineClient};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Startup timeout of a strategy that was not given one.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// A readiness probe with its own startup timeout.
#[async_trait]
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Wait until the container is ready, or fail once the startup timeout
    /// has passed.
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()>;

    /// Current startup timeout.
    fn startup_timeout(&self) -> Duration;

    /// Replace the startup timeout.
    fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Whether the container must still be running for this strategy to
    /// make sense.
    fn requires_running(&self) -> bool {
        true
    }
}

/// What a strategy probes: the container handle plus the engine.
#[derive(Clone)]
pub struct WaitTarget {
    handle: ContainerHandle,
    engine: Arc<dyn EngineClient>,
}

impl WaitTarget {
    /// Target a started container.
    pub fn new(handle: ContainerHandle, engine: Arc<dyn EngineClient>) -> Self {
        Self { handle, engine }
    }

    /// The container handle.
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Container identifier.
    pub fn id(&self) -> &ContainerId {
        self.handle.id()
    }

    /// The engine client.
    pub fn engine(&self) -> Arc<dyn EngineClient> {
        self.engine.clone()
    }
}

impl fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTarget")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Factory for the built-in strategies.
pub struct Wait;

impl Wait {
    /// Wait for every exposed port to accept TCP connections.
    pub fn for_listening_port() -> PortOpen {
        PortOpen::new()
    }

    /// Wait for the given container ports to accept TCP connections.
    pub fn for_listening_ports(ports: impl IntoIterator<Item = u16>) -> PortOpen {
        PortOpen::new().with_ports(ports)
    }

    /// Wait for `pattern` to appear `times` times in the container output.
    pub fn for_log_message(pattern: &str, times: usize) -> Result<LogPattern> {
        Ok(LogPattern::new(pattern)?.with_times(times))
    }

    /// Wait for an HTTP request to `path` to succeed.
    pub fn for_http(path: impl Into<String>) -> HttpProbe {
        HttpProbe::new(path)
    }

    /// Wait for the engine healthcheck to report healthy.
    pub fn for_healthcheck() -> HealthCheck {
        HealthCheck::new()
    }

    /// Wait for the container process to exit.
    pub fn for_exit() -> ProcessExit {
        ProcessExit::new()
    }

    /// Wait for `command` to exit 0 inside the container.
    pub fn for_successful_command<I, S>(command: I) -> CommandSuccess
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSuccess::new(command)
    }

    /// Run several strategies in order under one shared outer timeout.
    pub fn for_all() -> CompositeWait {
        CompositeWait::new(TimeoutMode::SharedOuterTimeout)
    }
}

/// Turn an exhausted budget into a launch failure; other errors pass through.
pub(crate) fn exhausted(what: impl fmt::Display, timeout: Duration, err: CoreError) -> CoreError {
    match err {
        CoreError::Timeout { .. } | CoreError::RetryExhausted { .. } => LaunchFailure::new(
            LaunchFailureKind::NeverReady,
            format!("{what} (waited {timeout:?})"),
        )
        .with_source(err)
        .into(),
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Targets backed by the scripted engine.

    use super::*;
    use crate::state::{LifecycleState, StateMachine};
    use berth_engine::scripted::ScriptedEngine;
    use berth_engine::ContainerRequest;

    /// Create and start a scripted container, returning a target for it.
    pub(crate) async fn started(engine: &ScriptedEngine, exposed: &[u16]) -> WaitTarget {
        let mut request = ContainerRequest::builder("scripted:latest");
        for port in exposed {
            request = request.expose(*port);
        }
        let request = request.build().unwrap();
        let id = engine.create(&request).await.unwrap();
        engine.start(&id).await.unwrap();
        let inspection = engine.inspect(&id).await.unwrap();

        let state = StateMachine::new();
        for next in [
            LifecycleState::Creating,
            LifecycleState::Starting,
            LifecycleState::AwaitingReadiness,
        ] {
            state.transition(next).unwrap();
        }
        let handle = ContainerHandle::new(
            id,
            request.image,
            engine.host(),
            request.exposed_ports,
            inspection.ports,
            state,
        );
        WaitTarget::new(handle, Arc::new(engine.clone()))
    }

    /// A strategy that sleeps, then succeeds or fails; records when it ran.
    #[derive(Debug, Clone)]
    pub(crate) struct Sleeper {
        pub name: &'static str,
        pub sleep: Duration,
        pub fail: bool,
        pub timeout: Duration,
        pub runs: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Sleeper {
        pub(crate) fn new(
            name: &'static str,
            sleep: Duration,
            runs: &Arc<std::sync::Mutex<Vec<&'static str>>>,
        ) -> Self {
            Self {
                name,
                sleep,
                fail: false,
                timeout: DEFAULT_STARTUP_TIMEOUT,
                runs: runs.clone(),
            }
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl WaitStrategy for Sleeper {
        async fn wait_until_ready(&self, _target: &WaitTarget) -> Result<()> {
            self.runs.lock().unwrap().push(self.name);
            if self.sleep > self.timeout {
                tokio::time::sleep(self.timeout).await;
                return Err(exhausted(self.name, self.timeout, CoreError::Timeout {
                    waited: self.timeout,
                    last_error: None,
                }));
            }
            tokio::time::sleep(self.sleep).await;
            if self.fail {
                return Err(LaunchFailure::new(LaunchFailureKind::NeverReady, self.name).into());
            }
            Ok(())
        }

        fn startup_timeout(&self) -> Duration {
            self.timeout
        }

        fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }
    }
}
