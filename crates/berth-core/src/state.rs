//! Lifecycle state of one container.

use crate::error::{CoreError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where a container is in its lifecycle.
///
/// ```text
/// NotStarted → Creating → Starting → AwaitingReadiness → Running → Stopping → Stopped
///                  ↑__________|_______________|   (startup retry)
/// any non-terminal state → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Controller built, nothing asked of the engine yet.
    NotStarted,
    /// Engine is creating the container.
    Creating,
    /// Engine is starting the container.
    Starting,
    /// Wait strategy is running.
    AwaitingReadiness,
    /// Ready and handed to the caller.
    Running,
    /// Deliberate stop in progress.
    Stopping,
    /// Stopped and removed. Terminal.
    Stopped,
    /// Launch failed or the container died. Terminal.
    Failed,
}

impl LifecycleState {
    /// True for `Stopped` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (NotStarted, Creating)
                | (Creating, Starting)
                | (Starting, AwaitingReadiness)
                | (AwaitingReadiness, Running)
                | (Creating | Starting | AwaitingReadiness, Creating)
                | (Creating | Starting | AwaitingReadiness | Running, Stopping)
                | (Stopping, Stopped)
                | (_, Failed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Creating => write!(f, "creating"),
            Self::Starting => write!(f, "starting"),
            Self::AwaitingReadiness => write!(f, "awaiting_readiness"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Shared, checked lifecycle state.
///
/// Cloning shares the same state; the controller, its handle and its exit
/// watcher all hold one.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: Arc<Mutex<LifecycleState>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// New state machine in `NotStarted`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::NotStarted)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn current(&self) -> LifecycleState {
        *self.lock()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransition`] if the edge is not allowed.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState> {
        let mut state = self.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(CoreError::InvalidTransition { from, to: next });
        }
        *state = next;
        tracing::trace!(%from, to = %next, "Lifecycle transition");
        Ok(from)
    }

    /// Move to `Failed` unless already terminal. Returns true if it moved.
    pub fn fail(&self) -> bool {
        self.transition(LifecycleState::Failed).is_ok()
    }

    /// Claim the stop: move to `Stopping` if a stop is meaningful.
    ///
    /// Returns false when terminal, already stopping, or never started.
    pub(crate) fn begin_stop(&self) -> bool {
        self.transition(LifecycleState::Stopping).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 8] = [
        NotStarted,
        Creating,
        Starting,
        AwaitingReadiness,
        Running,
        Stopping,
        Stopped,
        Failed,
    ];

    #[test]
    fn test_happy_path() {
        let machine = StateMachine::new();
        for next in [Creating, Starting, AwaitingReadiness, Running, Stopping, Stopped] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.current(), Stopped);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Stopped, Failed] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        for state in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(Failed), "{state} -> failed");
        }
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let machine = StateMachine::new();
        let err = machine.transition(Running).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: NotStarted,
                to: Running
            }
        ));
        assert!(!NotStarted.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Creating));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_begin_stop_only_once() {
        let machine = StateMachine::new();
        assert!(!machine.begin_stop());
        for next in [Creating, Starting, AwaitingReadiness, Running] {
            machine.transition(next).unwrap();
        }
        assert!(machine.begin_stop());
        assert!(!machine.begin_stop());
        machine.transition(Stopped).unwrap();
        assert!(!machine.begin_stop());
        assert!(!machine.fail());
    }

    #[test]
    fn test_clones_share_state() {
        let machine = StateMachine::new();
        let observer = machine.clone();
        machine.transition(Creating).unwrap();
        assert_eq!(observer.current(), Creating);
        assert!(observer.fail());
        assert_eq!(machine.current(), Failed);
    }
}
