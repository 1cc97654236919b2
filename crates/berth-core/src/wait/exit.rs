use super::{exhausted, WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{LaunchFailure, LaunchFailureKind, Result};
use crate::time_bound;
use async_trait::async_trait;
use std::time::Duration;

/// Ready once the container process has exited, for one-shot workloads.
///
/// The container is not expected to be running when this completes.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    startup_timeout: Duration,
    expected_exit_code: Option<i64>,
}

impl Default for ProcessExit {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExit {
    /// Accept any exit code within the default startup timeout.
    pub fn new() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            expected_exit_code: None,
        }
    }

    /// Also require the process to exit with `code`.
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.expected_exit_code = Some(code);
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

#[async_trait]
impl WaitStrategy for ProcessExit {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let id = target.id().clone();
        let engine = target.engine();
        tracing::debug!(
            container_id = %id.short(),
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for container to exit"
        );

        let waited_id = id.clone();
        let code = time_bound::run(self.startup_timeout, async move {
            engine.wait_for_exit(&waited_id).await
        })
        .await
        .map_err(|e| exhausted("container process never exited", self.startup_timeout, e))?;

        match self.expected_exit_code {
            Some(expected) if expected != code => Err(LaunchFailure::new(
                LaunchFailureKind::NeverReady,
                format!(
                    "container {} exited with code {code}, expected {expected}",
                    id.short()
                ),
            )
            .into()),
            _ => {
                tracing::debug!(container_id = %id.short(), exit_code = code, "Container exited");
                Ok(())
            }
        }
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.startup_timeout = timeout;
        Ok(())
    }

    fn requires_running(&self) -> bool {
        false
    }
}
