//! The engine client seam.

use crate::error::Result;
use crate::request::ContainerRequest;
use crate::types::{ContainerId, ContainerInspection, ExecOutput};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Combined stdout/stderr of a container, chunk by chunk.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Operations berth needs from a container runtime.
///
/// Implementations must be `Send + Sync`; one client is shared by every
/// controller, wait strategy and exit watcher in the process.
///
/// # Contract
///
/// - [`wait_for_exit`](Self::wait_for_exit) blocks until the main process of
///   the container terminates, returning its exit code. A non-zero exit code
///   is a value, not an error.
/// - [`stop`](Self::stop) is forceful; callers do not expect a graceful
///   shutdown window.
/// - [`host`](Self::host) is the address at which published ports are
///   reachable from the calling process.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Create a container, returning its identifier.
    async fn create(&self, request: &ContainerRequest) -> Result<ContainerId>;

    /// Start a created container.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Inspect process status, health and published ports.
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInspection>;

    /// Stop the container's main process.
    async fn stop(&self, id: &ContainerId) -> Result<()>;

    /// Remove the container and its anonymous volumes.
    async fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Block until the container's main process exits.
    async fn wait_for_exit(&self, id: &ContainerId) -> Result<i64>;

    /// Stream combined output; with `follow` the stream stays open until the
    /// container exits.
    fn stream_logs(&self, id: &ContainerId, follow: bool) -> LogStream;

    /// Run a command inside the running container.
    async fn execute(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput>;

    /// Host at which published ports are reachable.
    fn host(&self) -> String;
}

/// Collect everything a container has written so far.
pub async fn collect_logs(engine: &dyn EngineClient, id: &ContainerId) -> Result<String> {
    let mut stream = engine.stream_logs(id, false);
    let mut output = Vec::new();
    while let Some(chunk) = stream.next().await {
        output.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedEngine;

    #[tokio::test]
    async fn test_collect_logs_keeps_invalid_utf8_output() {
        let engine = ScriptedEngine::new()
            .with_logs(["starting"])
            .with_raw_output(&b"bad \xff byte\n"[..]);
        let request = ContainerRequest::builder("alpine:3.19").build().unwrap();
        let id = engine.create(&request).await.unwrap();

        let output = collect_logs(&engine, &id).await.unwrap();
        assert_eq!(output, "starting\nbad \u{FFFD} byte\n");
    }
}
