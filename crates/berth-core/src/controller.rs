//! Lifecycle orchestration for one container.
//!
//! ```text
//!  start() ──► create ──► start ──► startup check ──► wait strategy ──► Running
//!                 │          │             │                 │             │
//!                 └──────────┴──── failure ┴─────────────────┘             ├─► ExitWatcher
//!                          remove container, retry or Failed               └─► cleanup hook
//! ```

use crate::cleanup::{CleanupRegistry, CleanupToken};
use crate::config::ContainerConfig;
use crate::error::{CoreError, LaunchFailure, LaunchFailureKind, Result};
use crate::handle::ContainerHandle;
use crate::retry;
use crate::state::{LifecycleState, StateMachine};
use crate::throttle::Throttle;
use crate::wait::{WaitStrategy, WaitTarget};
use crate::watcher::ExitWatcher;
use berth_engine::{
    collect_logs, ContainerId, ContainerInspection, ContainerStatus, EngineClient, EngineError,
    ExecOutput,
};
use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Upper bound on how long a started container may stay in `created`.
const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Spacing between inspections while a container is still `created`.
const STARTUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Shared state
// ============================================================================

/// State reachable from the controller, its cleanup hook and its `Drop`.
struct Shared {
    engine: Arc<dyn EngineClient>,
    state: StateMachine,
    container: Mutex<Option<ContainerId>>,
    watcher: Mutex<Option<ExitWatcher>>,
}

impl Shared {
    fn container(&self) -> MutexGuard<'_, Option<ContainerId>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watcher(&self) -> MutexGuard<'_, Option<ExitWatcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn container_id(&self) -> Option<ContainerId> {
        self.container().clone()
    }

    /// Stop and remove the container. Safe to call any number of times.
    async fn stop(&self) {
        if !self.state.begin_stop() {
            return;
        }
        // Visible to the watcher before the engine is asked to stop.
        if let Some(watcher) = self.watcher().as_ref() {
            watcher.expect_termination();
        }

        let Some(id) = self.container_id() else {
            let _ = self.state.transition(LifecycleState::Stopped);
            return;
        };
        let started = Instant::now();
        info!(container_id = %id.short(), "Stopping container");

        if let Err(err) = self.engine.stop(&id).await {
            warn!(container_id = %id.short(), error = %err, "Failed to stop container");
        }
        match self.engine.remove(&id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(err) => {
                warn!(container_id = %id.short(), error = %err, "Failed to remove container");
            }
        }
        if let Some(watcher) = self.watcher().take() {
            watcher.abort();
        }

        let _ = self.state.transition(LifecycleState::Stopped);
        info!(
            container_id = %id.short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Container stopped"
        );
    }

    /// Best-effort removal of a container from a failed start attempt.
    async fn discard(&self, id: &ContainerId) {
        if let Err(err) = self.engine.remove(id).await {
            warn!(container_id = %id.short(), error = %err, "Failed to remove container after failed start");
        }
        self.container().take();
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Owns the create → start → await → stop lifecycle of one container.
///
/// # Example
///
/// ```no_run
/// use berth_core::{ContainerConfig, LifecycleController, Wait};
/// use berth_engine::{ContainerRequest, DockerEngine};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> berth_core::Result<()> {
/// let request = ContainerRequest::builder("redis:7-alpine").expose(6379).build()?;
/// let config = ContainerConfig::builder(request)
///     .wait_for(Wait::for_log_message("Ready to accept connections", 1)?)
///     .startup_timeout(Duration::from_secs(30))
///     .build()?;
///
/// let mut redis = LifecycleController::new(Arc::new(DockerEngine::connect()?), config);
/// let handle = redis.start().await?;
/// let (host, port) = handle.endpoint(6379)?;
/// println!("redis at {host}:{port}");
///
/// redis.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct LifecycleController {
    config: ContainerConfig,
    shared: Arc<Shared>,
    handle: Option<ContainerHandle>,
    unexpected: tokio::sync::Mutex<Option<oneshot::Receiver<CoreError>>>,
    registry: CleanupRegistry,
    cleanup_token: Mutex<Option<CleanupToken>>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("image", &self.config.request.image)
            .field("state", &self.state())
            .field("container", &self.shared.container_id())
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Controller for `config`, registering cleanup in the global registry.
    pub fn new(engine: Arc<dyn EngineClient>, config: ContainerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                engine,
                state: StateMachine::new(),
                container: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
            handle: None,
            unexpected: tokio::sync::Mutex::new(None),
            registry: CleanupRegistry::global().clone(),
            cleanup_token: Mutex::new(None),
        }
    }

    /// Register the cleanup hook in `registry` instead of the global one.
    pub fn with_cleanup_registry(mut self, registry: CleanupRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.state.current()
    }

    /// Handle of the running container, once started.
    pub fn handle(&self) -> Option<ContainerHandle> {
        self.handle.clone()
    }

    /// The configuration this controller launches.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Create, start and wait for the container.
    ///
    /// With more than one startup attempt, a failed attempt removes its
    /// container and the whole sequence runs again.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidTransition`] if already started
    /// - [`CoreError::Launch`] if the engine failed or the container never
    ///   became ready; the state is `Failed` afterwards
    pub async fn start(&mut self) -> Result<ContainerHandle> {
        let current = self.state();
        if current != LifecycleState::NotStarted {
            return Err(CoreError::InvalidTransition {
                from: current,
                to: LifecycleState::Creating,
            });
        }

        let attempts = self.config.startup_attempts;
        let image = self.config.request.image.clone();
        let started = Instant::now();
        info!(image = %image, attempts, "Starting container");

        let this = &*self;
        let outcome = if attempts == 1 {
            this.attempt_start().await
        } else {
            retry::until_success_or_attempts(attempts, || this.attempt_start())
                .await
                .map_err(|err| match err {
                    CoreError::RetryExhausted { .. } => LaunchFailure::new(
                        LaunchFailureKind::AttemptsExhausted,
                        format!("container from {image} did not start in {attempts} attempts"),
                    )
                    .with_source(err)
                    .into(),
                    other => other,
                })
        };

        let handle = match outcome {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.state.fail();
                error!(image = %image, error = %err, "Container failed to start");
                return Err(err);
            }
        };

        self.on_running(&handle);
        info!(
            container_id = %handle.id().short(),
            image = %image,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Container ready"
        );
        Ok(handle)
    }

    /// One create → start → check → wait pass.
    async fn attempt_start(&self) -> Result<ContainerHandle> {
        let shared = &self.shared;
        let request = &self.config.request;
        let wait = self.config.wait.as_ref();

        shared.state.transition(LifecycleState::Creating)?;
        let id = shared.engine.create(request).await.map_err(|err| {
            launch_failure(
                LaunchFailureKind::Engine,
                format!("could not create container from {}", request.image),
                err,
            )
        })?;
        *shared.container() = Some(id.clone());
        info!(container_id = %id.short(), image = %request.image, "Container created");

        let handle = match self.run_attempt(&id, wait).await {
            Ok(handle) => handle,
            Err(err) => {
                self.log_output(&id).await;
                shared.discard(&id).await;
                return Err(err);
            }
        };

        shared.state.transition(LifecycleState::Running)?;
        Ok(handle)
    }

    async fn run_attempt(
        &self,
        id: &ContainerId,
        wait: &dyn WaitStrategy,
    ) -> Result<ContainerHandle> {
        let shared = &self.shared;

        shared.state.transition(LifecycleState::Starting)?;
        shared.engine.start(id).await.map_err(|err| {
            launch_failure(
                LaunchFailureKind::Engine,
                format!("could not start container {}", id.short()),
                err,
            )
        })?;
        info!(container_id = %id.short(), "Container started");

        let inspection = self.startup_check(id, wait).await?;

        shared.state.transition(LifecycleState::AwaitingReadiness)?;
        let host = self
            .config
            .settings
            .host_override
            .clone()
            .unwrap_or_else(|| shared.engine.host());
        let handle = ContainerHandle::new(
            id.clone(),
            self.config.request.image.clone(),
            host,
            self.config.request.exposed_ports.clone(),
            inspection.ports,
            shared.state.clone(),
        );

        debug!(container_id = %id.short(), strategy = ?wait, "Waiting for readiness");
        let target = WaitTarget::new(handle, shared.engine.clone());
        if let Err(err) = wait.wait_until_ready(&target).await {
            return Err(self.diagnose(id, wait, err).await);
        }
        Ok(target.handle().clone())
    }

    /// Wait until the engine reports the container past `created`.
    async fn startup_check(
        &self,
        id: &ContainerId,
        wait: &dyn WaitStrategy,
    ) -> Result<ContainerInspection> {
        let engine = self.shared.engine.clone();
        let checked = id.clone();
        let deadline = wait.startup_timeout().min(STARTUP_CHECK_TIMEOUT);
        let throttle = Arc::new(Throttle::new(STARTUP_CHECK_INTERVAL));
        let inspection = retry::until_success_or_deadline(deadline, move || {
            let engine = engine.clone();
            let throttle = throttle.clone();
            let id = checked.clone();
            async move {
                let inspection = throttle
                    .run(engine.inspect(&id))
                    .await
                    .map_err(|e| e.to_string())?;
                if inspection.status == ContainerStatus::Created {
                    return Err("container still in created state".to_string());
                }
                Ok(inspection)
            }
        })
        .await
        .map_err(|err| match err {
            CoreError::Timeout { .. } => launch_failure(
                LaunchFailureKind::Engine,
                format!("container {} never left the created state", id.short()),
                err,
            ),
            other => other,
        })?;

        if wait.requires_running() && inspection.status.has_exited() {
            return Err(LaunchFailure::new(
                LaunchFailureKind::ExitedEarly,
                format!(
                    "container {} exited during startup{}",
                    id.short(),
                    exit_code_suffix(inspection.exit_code)
                ),
            )
            .into());
        }
        Ok(inspection)
    }

    /// Explain a readiness failure by what happened to the container.
    async fn diagnose(
        &self,
        id: &ContainerId,
        wait: &dyn WaitStrategy,
        err: CoreError,
    ) -> CoreError {
        let inspection = match self.shared.engine.inspect(id).await {
            Ok(inspection) => inspection,
            Err(_) => return err,
        };

        let reason = if inspection.oom_killed {
            Some("container was killed for running out of memory".to_string())
        } else if inspection.status == ContainerStatus::Dead {
            Some("container is dead".to_string())
        } else if let Some(message) = inspection.error.filter(|m| !m.is_empty()) {
            Some(format!("engine reported: {message}"))
        } else if wait.requires_running() && inspection.status.has_exited() {
            Some(format!(
                "container exited{}",
                exit_code_suffix(inspection.exit_code)
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => LaunchFailure::new(
                LaunchFailureKind::ExitedEarly,
                format!("{reason} while waiting for readiness"),
            )
            .with_source(err)
            .into(),
            None => err,
        }
    }

    async fn log_output(&self, id: &ContainerId) {
        match collect_logs(self.shared.engine.as_ref(), id).await {
            Ok(output) if !output.trim().is_empty() => {
                error!(container_id = %id.short(), output = %output.trim_end(), "Output of failed container");
            }
            Ok(_) => {}
            Err(err) => debug!(container_id = %id.short(), error = %err, "Could not collect output"),
        }
    }

    /// Record the handle, spawn the exit watcher and register the cleanup hook.
    fn on_running(&mut self, handle: &ContainerHandle) {
        self.handle = Some(handle.clone());
        if self.config.settings.reaper_disabled {
            debug!(container_id = %handle.id().short(), "Exit watcher and cleanup hook disabled");
            return;
        }

        // One-shot workloads have already exited by now.
        if self.config.wait.requires_running() {
            let (report, receiver) = oneshot::channel();
            let watcher = ExitWatcher::spawn(
                self.shared.engine.clone(),
                handle.id().clone(),
                self.shared.state.clone(),
                report,
            );
            *self.shared.watcher() = Some(watcher);
            *self.unexpected.get_mut() = Some(receiver);
        }

        let shared = self.shared.clone();
        let token = self.registry.register(
            format!("stop container {}", handle.id().short()),
            move || async move { shared.stop().await },
        );
        *self.cleanup_token.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// Stop and remove the container.
    ///
    /// A no-op once stopped or failed. Engine errors are logged, not
    /// returned: the state ends up `Stopped` either way.
    pub async fn stop(&self) {
        if let Some(token) = self
            .cleanup_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.registry.deregister(token);
        }
        self.shared.stop().await;
    }

    /// Wait for the container to exit without a preceding [`stop`](Self::stop).
    ///
    /// Resolves at most once; pends forever when no such exit can be
    /// reported (not started, watcher disabled, stopped deliberately).
    /// Cancel-safe.
    pub async fn wait_for_unexpected_exit(&self) -> CoreError {
        let mut slot = self.unexpected.lock().await;
        if let Some(receiver) = slot.as_mut() {
            let outcome = receiver.await;
            *slot = None;
            if let Ok(err) = outcome {
                return err;
            }
        }
        drop(slot);
        future::pending().await
    }

    /// The unexpected exit, if one has been reported and not yet taken.
    pub fn try_unexpected_exit(&self) -> Option<CoreError> {
        let mut slot = self.unexpected.try_lock().ok()?;
        match slot.as_mut()?.try_recv() {
            Ok(err) => {
                *slot = None;
                Some(err)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                *slot = None;
                None
            }
        }
    }

    /// Everything the container has written so far.
    pub async fn logs(&self) -> Result<String> {
        let id = self.require_container()?;
        Ok(collect_logs(self.shared.engine.as_ref(), &id).await?)
    }

    /// Run `cmd` inside the running container.
    pub async fn execute<I, S>(&self, cmd: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.require_container()?;
        if self.state() != LifecycleState::Running {
            return Err(CoreError::precondition(format!(
                "cannot execute in a container that is {}",
                self.state()
            )));
        }
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        Ok(self.shared.engine.execute(&id, &cmd).await?)
    }

    fn require_container(&self) -> Result<ContainerId> {
        self.shared
            .container_id()
            .ok_or_else(|| CoreError::precondition("container has not been created"))
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        let state = self.state();
        if state == LifecycleState::NotStarted || state.is_terminal() {
            return;
        }
        if let Some(token) = self
            .cleanup_token
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.registry.deregister(token);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = self.shared.clone();
                runtime.spawn(async move { shared.stop().await });
            }
            Err(_) => warn!(
                container = ?self.shared.container_id(),
                "Controller dropped outside a runtime; container left running"
            ),
        }
    }
}

fn launch_failure(
    kind: LaunchFailureKind,
    message: String,
    cause: impl Into<crate::error::BoxError>,
) -> CoreError {
    LaunchFailure::new(kind, message).with_source(cause).into()
}

fn exit_code_suffix(code: Option<i64>) -> String {
    code.map(|code| format!(" with code {code}")).unwrap_or_default()
}
