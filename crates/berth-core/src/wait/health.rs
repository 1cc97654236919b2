use super::{exhausted, WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{LaunchFailure, LaunchFailureKind, Result};
use crate::retry;
use crate::throttle::Throttle;
use async_trait::async_trait;
use berth_engine::HealthState;
use std::sync::Arc;
use std::time::Duration;

/// Ready once the engine's own healthcheck reports healthy.
///
/// An explicit `unhealthy` report fails at once with
/// [`LaunchFailureKind::Unhealthy`]; running out of time fails with
/// [`LaunchFailureKind::NeverReady`].
#[derive(Debug, Clone)]
pub struct HealthCheck {
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCheck {
    /// Poll the healthcheck every 100 ms for up to the default startup timeout.
    pub fn new() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Minimum spacing between inspections.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl WaitStrategy for HealthCheck {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let id = target.id().clone();
        let engine = target.engine();
        let throttle = Arc::new(Throttle::new(self.poll_interval));
        tracing::debug!(
            container_id = %id.short(),
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for healthcheck"
        );

        // Healthy and Unhealthy both end the loop; anything else retries.
        let probe_id = id.clone();
        let verdict = retry::until_success_or_deadline(self.startup_timeout, move || {
            let engine = engine.clone();
            let throttle = throttle.clone();
            let id = probe_id.clone();
            async move {
                let inspection = throttle
                    .run(engine.inspect(&id))
                    .await
                    .map_err(|e| e.to_string())?;
                match inspection.health {
                    HealthState::Healthy | HealthState::Unhealthy => Ok(inspection.health),
                    HealthState::Starting => Err("healthcheck still starting".to_string()),
                    HealthState::None => Err("container defines no healthcheck".to_string()),
                }
            }
        })
        .await
        .map_err(|e| exhausted("container never became healthy", self.startup_timeout, e))?;

        if verdict == HealthState::Unhealthy {
            return Err(LaunchFailure::new(
                LaunchFailureKind::Unhealthy,
                format!("container {} reported unhealthy", id.short()),
            )
            .into());
        }
        Ok(())
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.startup_timeout = timeout;
        Ok(())
    }
}
