//! Minimum spacing between repeated invocations.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Guarantees at least `min_spacing` between invocations made through it.
///
/// Callers that arrive early sleep; an invocation is never skipped. Each
/// polling loop owns its own `Throttle`.
#[derive(Debug)]
pub struct Throttle {
    min_spacing: Duration,
    last_invocation: Mutex<Option<Instant>>,
}

impl Throttle {
    /// Throttle with a fixed minimum spacing.
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_invocation: Mutex::new(None),
        }
    }

    /// Throttle allowing `invocations` per `per` (spacing `per / invocations`).
    pub fn with_rate(invocations: u32, per: Duration) -> Result<Self> {
        if invocations == 0 {
            return Err(CoreError::precondition("throttle rate must be positive"));
        }
        Ok(Self::new(per / invocations))
    }

    /// Configured minimum spacing.
    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Run `op` once at least `min_spacing` has passed since the previous
    /// invocation through this throttle.
    pub async fn run<F: Future>(&self, op: F) -> F::Output {
        {
            let mut last = self.last_invocation.lock().await;
            if let Some(previous) = *last {
                let remaining = self.min_spacing.saturating_sub(previous.elapsed());
                if !remaining.is_zero() {
                    tokio::time::sleep(remaining).await;
                }
            }
            *last = Some(Instant::now());
        }
        op.await
    }
}
