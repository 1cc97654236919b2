//! In-process engine with scripted behaviour, for tests.
//!
//! [`ScriptedEngine`] keeps containers in memory and lets a test decide how
//! they behave: which calls fail, which ports are published, what the
//! healthcheck reports, what the container prints and when it dies.
//!
//! ```
//! use berth_engine::scripted::ScriptedEngine;
//! use berth_engine::HealthState;
//! use std::time::Duration;
//!
//! let engine = ScriptedEngine::new()
//!     .with_port(6379, 49153)
//!     .with_health([HealthState::Starting, HealthState::Healthy])
//!     .with_repeating_log("I'm ready!", Duration::from_secs(1));
//! # let _ = engine;
//! ```

use crate::client::{EngineClient, LogStream};
use crate::error::{EngineError, Result};
use crate::request::ContainerRequest;
use crate::types::{ContainerId, ContainerInspection, ContainerStatus, ExecOutput, HealthState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Exit code reported when a running container is stopped or removed.
pub const KILLED_EXIT_CODE: i64 = 137;

/// A mutating call recorded by [`ScriptedEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(ContainerRequest),
    Start(ContainerId),
    Stop(ContainerId),
    Remove(ContainerId),
    Exec(ContainerId, Vec<String>),
}

#[derive(Debug, Default, Clone)]
struct Script {
    create_failures: usize,
    start_failures: usize,
    stop_failures: usize,
    wait_failures: usize,
    start_delay: Option<Duration>,
    exit_on_start: Option<i64>,
    exit_after: Option<(Duration, i64)>,
    oom_on_exit: bool,
    ports: BTreeMap<u16, u16>,
    health: Vec<HealthState>,
    log_lines: Vec<Bytes>,
    repeating_log: Option<(String, Duration)>,
    exec_results: VecDeque<ExecOutput>,
}

#[derive(Debug)]
struct ScriptedContainer {
    status: ContainerStatus,
    health: VecDeque<HealthState>,
    oom_killed: bool,
    removed: bool,
    exit: watch::Sender<Option<i64>>,
}

impl ScriptedContainer {
    fn exit_code(&self) -> Option<i64> {
        *self.exit.borrow()
    }

    fn terminate(&mut self, code: i64) {
        if self.status.has_exited() {
            return;
        }
        self.status = ContainerStatus::Exited;
        self.exit.send_replace(Some(code));
    }
}

#[derive(Debug, Default)]
struct EngineState {
    script: Script,
    next_id: u64,
    containers: HashMap<ContainerId, ScriptedContainer>,
    calls: Vec<EngineCall>,
    inspections: usize,
}

/// Scripted in-memory [`EngineClient`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<EngineState>>,
}

impl ScriptedEngine {
    /// Engine whose containers start, run and publish nothing.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn script(self, edit: impl FnOnce(&mut Script)) -> Self {
        edit(&mut self.lock().script);
        self
    }

    /// Publish container `port` on host `host_port`.
    pub fn with_port(self, port: u16, host_port: u16) -> Self {
        self.script(|s| {
            s.ports.insert(port, host_port);
        })
    }

    /// Healthcheck results returned by successive inspections; the last sticks.
    pub fn with_health(self, states: impl IntoIterator<Item = HealthState>) -> Self {
        self.script(|s| s.health = states.into_iter().collect())
    }

    /// Lines printed once when the container starts.
    pub fn with_logs<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script(|s| {
            s.log_lines = lines
                .into_iter()
                .map(|line| {
                    let line: String = line.into();
                    Bytes::from(line + "\n")
                })
                .collect()
        })
    }

    /// Raw output chunk appended after the scripted lines.
    pub fn with_raw_output(self, chunk: impl Into<Bytes>) -> Self {
        self.script(|s| s.log_lines.push(chunk.into()))
    }

    /// A line printed every `every` while logs are followed.
    pub fn with_repeating_log(self, line: impl Into<String>, every: Duration) -> Self {
        self.script(|s| s.repeating_log = Some((line.into(), every)))
    }

    /// Results for successive exec calls; once drained every exec succeeds.
    pub fn with_exec_results(self, results: impl IntoIterator<Item = ExecOutput>) -> Self {
        self.script(|s| s.exec_results = results.into_iter().collect())
    }

    /// The next `count` create calls fail.
    pub fn fail_creates(self, count: usize) -> Self {
        self.script(|s| s.create_failures = count)
    }

    /// The next `count` start calls fail.
    pub fn fail_starts(self, count: usize) -> Self {
        self.script(|s| s.start_failures = count)
    }

    /// The next `count` stop calls fail.
    pub fn fail_stops(self, count: usize) -> Self {
        self.script(|s| s.stop_failures = count)
    }

    /// The next `count` wait-for-exit calls fail while the container keeps running.
    pub fn fail_waits(self, count: usize) -> Self {
        self.script(|s| s.wait_failures = count)
    }

    /// Started containers stay in `created` for `delay` before running.
    pub fn start_delay(self, delay: Duration) -> Self {
        self.script(|s| s.start_delay = Some(delay))
    }

    /// Containers exit with `code` as soon as they are started.
    pub fn exit_on_start(self, code: i64) -> Self {
        self.script(|s| s.exit_on_start = Some(code))
    }

    /// Containers exit with `code` once `after` has passed since start.
    pub fn exit_after(self, after: Duration, code: i64) -> Self {
        self.script(|s| s.exit_after = Some((after, code)))
    }

    /// Containers report being OOM-killed once they exit.
    pub fn oom_on_exit(self) -> Self {
        self.script(|s| s.oom_on_exit = true)
    }

    /// Terminate a container behind the caller's back.
    pub fn kill_out_of_band(&self, id: &ContainerId, code: i64) {
        let mut state = self.lock();
        let oom = state.script.oom_on_exit;
        if let Some(container) = state.containers.get_mut(id) {
            container.oom_killed = oom;
            container.terminate(code);
        }
    }

    /// Every mutating call so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of inspect calls so far.
    pub fn inspections(&self) -> usize {
        self.lock().inspections
    }

    /// Identifiers of every container created so far, in order.
    pub fn created(&self) -> Vec<ContainerId> {
        let state = self.lock();
        let mut ids: Vec<_> = state.containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request of the most recent create call.
    pub fn last_request(&self) -> Option<ContainerRequest> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            EngineCall::Create(request) => Some(request.clone()),
            _ => None,
        })
    }

    /// True once `id` has been removed.
    pub fn is_removed(&self, id: &ContainerId) -> bool {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.removed)
            .unwrap_or(false)
    }

    /// Current status of `id`, if it exists.
    pub fn status(&self, id: &ContainerId) -> Option<ContainerStatus> {
        self.lock().containers.get(id).map(|c| c.status)
    }

    fn with_container<T>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut ScriptedContainer) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => Ok(f(container)),
            _ => Err(EngineError::NotFound(id.clone())),
        }
    }
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    async fn create(&self, request: &ContainerRequest) -> Result<ContainerId> {
        request.validate()?;
        let mut state = self.lock();
        state.calls.push(EngineCall::Create(request.clone()));
        if state.script.create_failures > 0 {
            state.script.create_failures -= 1;
            return Err(EngineError::ImagePull {
                image: request.image.clone(),
                reason: "scripted create failure".into(),
            });
        }

        state.next_id += 1;
        let id = ContainerId::new(format!("{:064x}", state.next_id));
        let (exit, _) = watch::channel(None);
        let container = ScriptedContainer {
            status: ContainerStatus::Created,
            health: state.script.health.iter().copied().collect(),
            oom_killed: false,
            removed: false,
            exit,
        };
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        let (exit_after, start_delay) = {
            let mut state = self.lock();
            state.calls.push(EngineCall::Start(id.clone()));
            if state.script.start_failures > 0 {
                state.script.start_failures -= 1;
                return Err(EngineError::operation("start", id, "scripted start failure"));
            }
            let exit_on_start = state.script.exit_on_start;
            let oom = state.script.oom_on_exit;
            let exit_after = state.script.exit_after;
            let start_delay = state.script.start_delay;
            let container = match state.containers.get_mut(id) {
                Some(container) if !container.removed => container,
                _ => return Err(EngineError::NotFound(id.clone())),
            };
            if start_delay.is_none() {
                container.status = ContainerStatus::Running;
            }
            if let Some(code) = exit_on_start {
                container.oom_killed = oom;
                container.terminate(code);
            }
            (exit_after, start_delay)
        };

        if let Some(delay) = start_delay {
            let engine = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = engine.with_container(&id, |container| {
                    if container.status == ContainerStatus::Created {
                        container.status = ContainerStatus::Running;
                    }
                });
            });
        }

        if let Some((after, code)) = exit_after {
            let engine = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                engine.kill_out_of_band(&id, code);
            });
        }
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInspection> {
        let ports = {
            let mut state = self.lock();
            state.inspections += 1;
            state.script.ports.clone()
        };
        self.with_container(id, |container| {
            let health = if container.health.len() > 1 {
                container.health.pop_front().unwrap_or_default()
            } else {
                container.health.front().copied().unwrap_or_default()
            };
            let mut inspection = ContainerInspection::new(id.clone(), container.status);
            inspection.exit_code = container.exit_code();
            inspection.oom_killed = container.oom_killed;
            inspection.health = health;
            if container.status == ContainerStatus::Running {
                inspection.ports = ports;
            }
            inspection
        })
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Stop(id.clone()));
        if state.script.stop_failures > 0 {
            state.script.stop_failures -= 1;
            return Err(EngineError::operation("stop", id, "scripted stop failure"));
        }
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => {
                container.terminate(KILLED_EXIT_CODE);
                Ok(())
            }
            _ => Err(EngineError::NotFound(id.clone())),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Remove(id.clone()));
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => {
                container.terminate(KILLED_EXIT_CODE);
                container.removed = true;
                Ok(())
            }
            _ => Err(EngineError::NotFound(id.clone())),
        }
    }

    async fn wait_for_exit(&self, id: &ContainerId) -> Result<i64> {
        {
            let mut state = self.lock();
            if state.script.wait_failures > 0 {
                state.script.wait_failures -= 1;
                return Err(EngineError::operation("wait", id, "scripted wait failure"));
            }
        }
        let mut exit = self.with_container(id, |c| c.exit.subscribe())?;
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::operation("wait", id, "engine dropped"))?;
        Ok(code.unwrap_or(-1))
    }

    fn stream_logs(&self, id: &ContainerId, follow: bool) -> LogStream {
        let state = self.lock();
        let exit = match state.containers.get(id) {
            Some(container) if !container.removed => container.exit.subscribe(),
            _ => {
                let missing = EngineError::NotFound(id.clone());
                return stream::once(async move { Err(missing) }).boxed();
            }
        };
        let head = stream::iter(
            state
                .script
                .log_lines
                .iter()
                .map(|chunk| Ok(chunk.clone()))
                .collect::<Vec<_>>(),
        );
        if !follow {
            return head.boxed();
        }

        match state.script.repeating_log.clone() {
            Some((line, every)) => {
                let tail = stream::unfold(exit, move |mut exit| {
                    let line = line.clone();
                    async move {
                        if exit.borrow().is_some() {
                            return None;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(every) => {
                                Some((Ok(Bytes::from(format!("{line}\n"))), exit))
                            }
                            _ = exit.changed() => None,
                        }
                    }
                });
                head.chain(tail).boxed()
            }
            None => {
                let tail = stream::once(async move {
                    let mut exit = exit;
                    let _ = exit.wait_for(Option::is_some).await;
                })
                .filter_map(|_| async { None::<Result<Bytes>> });
                head.chain(tail).boxed()
            }
        }
    }

    async fn execute(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Exec(id.clone(), cmd.to_vec()));
        match state.containers.get(id) {
            Some(container) if container.status == ContainerStatus::Running => {}
            Some(_) => return Err(EngineError::operation("exec", id, "container is not running")),
            None => return Err(EngineError::NotFound(id.clone())),
        }
        Ok(state.script.exec_results.pop_front().unwrap_or(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    fn host(&self) -> String {
        "127.0.0.1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn request() -> ContainerRequest {
        ContainerRequest::builder("alpine:3.19")
            .expose(80)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_start_inspect() {
        let engine = ScriptedEngine::new().with_port(80, 32768);
        let id = engine.create(&request()).await.unwrap();

        let created = engine.inspect(&id).await.unwrap();
        assert_eq!(created.status, ContainerStatus::Created);
        assert!(created.ports.is_empty());

        assert_ok!(engine.start(&id).await);
        let running = engine.inspect(&id).await.unwrap();
        assert!(running.is_running());
        assert_eq!(running.ports.get(&80), Some(&32768));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed() {
        let engine = ScriptedEngine::new().fail_creates(1).fail_starts(1);
        assert_err!(engine.create(&request()).await);
        let id = engine.create(&request()).await.unwrap();
        assert_err!(engine.start(&id).await);
        assert_ok!(engine.start(&id).await);
    }

    #[tokio::test]
    async fn test_health_sequence_last_sticks() {
        let engine = ScriptedEngine::new()
            .with_health([HealthState::Starting, HealthState::Healthy]);
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();

        assert_eq!(engine.inspect(&id).await.unwrap().health, HealthState::Starting);
        assert_eq!(engine.inspect(&id).await.unwrap().health, HealthState::Healthy);
        assert_eq!(engine.inspect(&id).await.unwrap().health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_wait_for_exit_sees_out_of_band_kill() {
        let engine = ScriptedEngine::new();
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();

        let waiter = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.wait_for_exit(&id).await })
        };
        tokio::task::yield_now().await;
        engine.kill_out_of_band(&id, 3);

        assert_eq!(waiter.await.unwrap().unwrap(), 3);
        let inspection = engine.inspect(&id).await.unwrap();
        assert_eq!(inspection.status, ContainerStatus::Exited);
        assert_eq!(inspection.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_remove_hides_container() {
        let engine = ScriptedEngine::new();
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();
        engine.remove(&id).await.unwrap();

        assert!(engine.is_removed(&id));
        assert!(matches!(
            engine.inspect(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.wait_for_exit(&id).await.ok(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_log_ends_on_exit() {
        let engine = ScriptedEngine::new()
            .with_logs(["booting"])
            .with_repeating_log("tick", Duration::from_secs(1));
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();

        let mut logs = engine.stream_logs(&id, true);
        assert_eq!(logs.next().await.unwrap().unwrap(), Bytes::from("booting\n"));
        assert_eq!(logs.next().await.unwrap().unwrap(), Bytes::from("tick\n"));

        engine.stop(&id).await.unwrap();
        assert!(logs.next().await.is_none());
    }

    #[tokio::test]
    async fn test_exec_results_then_default_success() {
        let engine = ScriptedEngine::new().with_exec_results([ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "not yet".into(),
        }]);
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();
        let cmd = vec!["true".to_string()];

        assert!(!engine.execute(&id, &cmd).await.unwrap().success());
        assert!(engine.execute(&id, &cmd).await.unwrap().success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delay_keeps_created() {
        let engine = ScriptedEngine::new().start_delay(Duration::from_millis(300));
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();
        assert_eq!(engine.status(&id), Some(ContainerStatus::Created));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(engine.status(&id), Some(ContainerStatus::Running));
        engine.inspect(&id).await.unwrap();
        assert_eq!(engine.inspections(), 1);
    }

    #[tokio::test]
    async fn test_scripted_wait_failure_leaves_container_running() {
        let engine = ScriptedEngine::new().fail_waits(1);
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();

        assert_err!(engine.wait_for_exit(&id).await);
        assert_eq!(engine.status(&id), Some(ContainerStatus::Running));
        engine.kill_out_of_band(&id, 4);
        assert_eq!(engine.wait_for_exit(&id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_exit_on_start() {
        let engine = ScriptedEngine::new().exit_on_start(1).oom_on_exit();
        let id = engine.create(&request()).await.unwrap();
        engine.start(&id).await.unwrap();

        let inspection = engine.inspect(&id).await.unwrap();
        assert_eq!(inspection.status, ContainerStatus::Exited);
        assert!(inspection.oom_killed);
        assert_eq!(engine.wait_for_exit(&id).await.unwrap(), 1);
    }
}
