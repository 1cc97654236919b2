use super::{exhausted, WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::Result;
use crate::retry;
use crate::throttle::Throttle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Timeout of a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between connect rounds.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ready once every configured port accepts a TCP connection.
///
/// With no ports configured, every exposed port of the container is probed.
#[derive(Debug, Clone)]
pub struct PortOpen {
    ports: Vec<u16>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl Default for PortOpen {
    fn default() -> Self {
        Self::new()
    }
}

impl PortOpen {
    /// Probe every exposed port.
    pub fn new() -> Self {
        Self {
            ports: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Probe only these container ports.
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the pause between connect rounds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

async fn probe(host: &str, port: u16) -> std::result::Result<(), String> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("{host}:{port}: {e}")),
        Err(_) => Err(format!("{host}:{port}: connect timed out")),
    }
}

#[async_trait]
impl WaitStrategy for PortOpen {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let handle = target.handle();
        let ports = if self.ports.is_empty() {
            handle.exposed_ports().to_vec()
        } else {
            self.ports.clone()
        };
        if ports.is_empty() {
            tracing::warn!(
                container_id = %handle.id().short(),
                "No ports to wait for; treating container as ready"
            );
            return Ok(());
        }

        let host = handle.host().to_string();
        let mut endpoints = Vec::with_capacity(ports.len());
        for port in &ports {
            endpoints.push(handle.mapped_port(*port)?);
        }
        let listing = endpoints
            .iter()
            .map(|port| format!("{host}:{port}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::debug!(
            container_id = %handle.id().short(),
            endpoints = %listing,
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for ports"
        );

        let throttle = Arc::new(Throttle::new(self.poll_interval));
        let endpoints = Arc::new(endpoints);
        retry::until_success_or_deadline(self.startup_timeout, move || {
            let throttle = throttle.clone();
            let endpoints = endpoints.clone();
            let host = host.clone();
            async move {
                throttle.run(async {}).await;
                for port in endpoints.iter() {
                    probe(&host, *port).await?;
                }
                Ok::<_, String>(())
            }
        })
        .await
        .map_err(|e| {
            exhausted(
                format!("port(s) {listing} never opened"),
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
