//! # berth-engine
//!
//! Container engine boundary for berth.
//! Everything berth asks of a container runtime goes through [`EngineClient`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use berth_engine::{ContainerRequest, DockerEngine, EngineClient};
//!
//! # async fn example() -> berth_engine::Result<()> {
//! let engine = DockerEngine::connect()?;
//! let request = ContainerRequest::builder("redis:7-alpine")
//!     .expose(6379)
//!     .build()?;
//!
//! let id = engine.create(&request).await?;
//! engine.start(&id).await?;
//! let inspection = engine.inspect(&id).await?;
//! println!("redis on {}:{:?}", engine.host(), inspection.ports.get(&6379));
//!
//! engine.stop(&id).await?;
//! engine.remove(&id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Docker**: [`DockerEngine`] speaks the Docker Engine API through bollard
//! - **Scripted engine**: `scripted::ScriptedEngine` (feature `test-util`)
//!   runs containers in memory with programmable failures

mod client;
mod docker;
mod error;
mod request;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
mod types;

pub use client::{collect_logs, EngineClient, LogStream};
pub use docker::DockerEngine;
pub use error::{EngineError, Result};
pub use request::{ContainerRequest, ContainerRequestBuilder};
pub use types::{
    ContainerId, ContainerInspection, ContainerStatus, ExecOutput, HealthState,
};
