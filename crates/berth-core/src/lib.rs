//! # berth-core
//!
//! Lifecycle orchestration and readiness waiting for disposable test
//! containers.
//!
//! This crate starts a container through an [`EngineClient`](berth_engine::EngineClient),
//! waits until it actually serves traffic, hands it to the caller and makes
//! sure it is torn down again, even when the caller forgets or the process
//! is interrupted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       berth-core                         │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────────┐     ┌───────────────────────┐  │
//! │  │ LifecycleController  │────▶│  ContainerConfig      │  │
//! │  │   - start()          │     │  (request + wait)     │  │
//! │  │   - stop()           │     └───────────────────────┘  │
//! │  │   - logs()/execute() │                                │
//! │  └──────────────────────┘                                │
//! │      │          │      └───────────────┐                 │
//! │      ▼          ▼                      ▼                 │
//! │  ┌──────────┐ ┌──────────────────┐ ┌─────────────────┐   │
//! │  │ Exit     │ │ WaitStrategy     │ │ CleanupRegistry │   │
//! │  │ Watcher  │ │  PortOpen, Log,  │ │ (process exit)  │   │
//! │  └──────────┘ │  Http, Health,   │ └─────────────────┘   │
//! │               │  Exit, Composite │                       │
//! │               └──────────────────┘                       │
//! │                        │                                 │
//! │                        ▼                                 │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ retry · throttle · time_bound (shared WorkerPool)  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │          berth-engine (Docker or scripted engine)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use berth_core::{ContainerConfig, LifecycleController, Wait};
//! use berth_engine::{ContainerRequest, DockerEngine};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> berth_core::Result<()> {
//! let request = ContainerRequest::builder("postgres:16-alpine")
//!     .expose(5432)
//!     .env("POSTGRES_PASSWORD", "secret")
//!     .build()?;
//!
//! // Ready once the port accepts connections and the server answers.
//! let wait = Wait::for_all()
//!     .with_strategy(Wait::for_listening_port())?
//!     .with_strategy(Wait::for_successful_command(["pg_isready", "-U", "postgres"]))?
//!     .with_startup_timeout(Duration::from_secs(60))?;
//!
//! let config = ContainerConfig::builder(request).wait_for(wait).build()?;
//! let mut postgres = LifecycleController::new(Arc::new(DockerEngine::connect()?), config);
//!
//! let handle = postgres.start().await?;
//! println!("postgres on {}:{}", handle.host(), handle.mapped_port(5432)?);
//!
//! postgres.stop().await;
//! berth_core::teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Readiness strategies**: port, log pattern, HTTP, healthcheck, process exit, command
//! - **Composition**: sequential strategies under a shared or individual timeouts
//! - **Bounded waits**: deadline and attempt based retry on a shared worker pool
//! - **Crash detection**: an exit watcher reports containers that die on their own
//! - **Cleanup**: containers are stopped on teardown or Ctrl-C

mod cleanup;
mod config;
mod controller;
mod error;
mod handle;
pub mod retry;
mod state;
mod throttle;
pub mod time_bound;
pub mod wait;
mod watcher;

pub use cleanup::{install_shutdown_hook, CleanupRegistry, CleanupToken};
pub use config::{
    session_id, BerthSettings, ContainerConfig, ContainerConfigBuilder, MANAGED_LABEL,
    SESSION_LABEL,
};
pub use controller::LifecycleController;
pub use error::{BoxError, CoreError, LaunchFailure, LaunchFailureKind, Result};
pub use handle::{ContainerHandle, HandleSummary};
pub use state::{LifecycleState, StateMachine};
pub use throttle::Throttle;
pub use time_bound::WorkerPool;
pub use wait::{Wait, WaitStrategy, WaitTarget};
pub use watcher::ExitWatcher;

/// Run every registered cleanup action, then shut the shared worker pool
/// down.
///
/// Call once, when the process is done with containers.
pub async fn teardown() {
    CleanupRegistry::global().run_all().await;
    time_bound::shutdown();
}
