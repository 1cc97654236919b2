//! Background detection of unexpected container exits.

use crate::error::CoreError;
use crate::state::StateMachine;
use crate::throttle::Throttle;
use berth_engine::{ContainerId, EngineClient, EngineError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spacing between wait-for-exit calls after the engine dropped one.
const REWAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-container task that blocks on the engine's wait-for-exit and reports
/// an exit nobody asked for.
///
/// The owning controller calls [`expect_termination`](Self::expect_termination)
/// before it asks the engine to stop the container; an exit observed while
/// the flag is clear moves the state to `Failed` and posts exactly one
/// [`CoreError::UnexpectedTermination`].
#[derive(Debug)]
pub struct ExitWatcher {
    termination_expected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ExitWatcher {
    /// Start watching `id`.
    pub fn spawn(
        engine: Arc<dyn EngineClient>,
        id: ContainerId,
        state: StateMachine,
        report: oneshot::Sender<CoreError>,
    ) -> Self {
        let termination_expected = Arc::new(AtomicBool::new(false));
        let expected = termination_expected.clone();
        let task = tokio::spawn(async move {
            let Some(exit_code) = watch_exit(engine.as_ref(), &id, &expected).await else {
                return;
            };

            if expected.load(Ordering::SeqCst) {
                debug!(container_id = %id.short(), ?exit_code, "Container exited as requested");
                return;
            }
            if !state.fail() {
                return;
            }

            warn!(container_id = %id.short(), ?exit_code, "Container exited unexpectedly");
            let _ = report.send(CoreError::UnexpectedTermination {
                container_id: id.clone(),
                exit_code,
            });
            if let Err(err) = engine.remove(&id).await {
                debug!(container_id = %id.short(), error = %err, "Failed to remove exited container");
            }
        });

        Self {
            termination_expected,
            task,
        }
    }

    /// Mark the next exit as deliberate.
    pub fn expect_termination(&self) {
        self.termination_expected.store(true, Ordering::SeqCst);
    }

    /// Whether the next exit is deliberate.
    pub fn is_termination_expected(&self) -> bool {
        self.termination_expected.load(Ordering::SeqCst)
    }

    /// True once the watcher has observed the exit or been stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop watching.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Block until the container is gone. `None` once a deliberate stop makes
/// the outcome irrelevant.
async fn watch_exit(
    engine: &dyn EngineClient,
    id: &ContainerId,
    expected: &AtomicBool,
) -> Option<Option<i64>> {
    let throttle = Throttle::new(REWAIT_INTERVAL);
    loop {
        let err = match throttle.run(engine.wait_for_exit(id)).await {
            Ok(code) => return Some(Some(code)),
            Err(err) => err,
        };
        if expected.load(Ordering::SeqCst) {
            return None;
        }
        match engine.inspect(id).await {
            Ok(inspection) if inspection.status.has_exited() => return Some(inspection.exit_code),
            Err(EngineError::NotFound(_)) => return Some(None),
            _ => {
                warn!(container_id = %id.short(), error = %err, "Wait for exit failed; watching again");
            }
        }
    }
}
