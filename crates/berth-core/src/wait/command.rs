use super::{exhausted, WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::Result;
use crate::retry;
use crate::throttle::Throttle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Ready once a command run inside the container exits with code 0.
#[derive(Debug, Clone)]
pub struct CommandSuccess {
    command: Vec<String>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl CommandSuccess {
    /// Run `command` once a second until it exits 0.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Minimum spacing between runs.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl WaitStrategy for CommandSuccess {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let id = target.id().clone();
        let engine = target.engine();
        let command = Arc::new(self.command.clone());
        let throttle = Arc::new(Throttle::new(self.poll_interval));
        let shown = self.command.join(" ");
        tracing::debug!(
            container_id = %id.short(),
            command = %shown,
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for command to succeed"
        );

        retry::until_success_or_deadline(self.startup_timeout, move || {
            let engine = engine.clone();
            let throttle = throttle.clone();
            let command = command.clone();
            let id = id.clone();
            async move {
                let output = throttle
                    .run(engine.execute(&id, &command))
                    .await
                    .map_err(|e| e.to_string())?;
                if output.success() {
                    Ok(())
                } else {
                    Err(format!(
                        "exit code {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    ))
                }
            }
        })
        .await
        .map_err(|e| {
            exhausted(
                format!("command `{shown}` never succeeded"),
                self.startup_timeout,
                e,
            )
        })
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.startup_timeout = timeout;
        Ok(())
    }
}
