use super::{exhausted, WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{CoreError, Result};
use crate::retry;
use crate::throttle::Throttle;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type StatusPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type BodyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Ready once an HTTP request is answered with an accepted status code and,
/// if configured, a body the predicate accepts.
///
/// Connection errors and rejected responses are "not ready yet". Requests
/// are spaced at least `poll_interval` apart.
///
/// Without explicit status codes or a status predicate only `200` is
/// accepted. With both, a response passes if either accepts it.
#[derive(Clone)]
pub struct HttpProbe {
    path: String,
    port: Option<u16>,
    method: Method,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    tls: bool,
    allow_insecure: bool,
    read_timeout: Duration,
    status_codes: BTreeSet<u16>,
    status_predicate: Option<StatusPredicate>,
    body_predicate: Option<BodyPredicate>,
    poll_interval: Duration,
    startup_timeout: Duration,
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe")
            .field("path", &self.path)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("tls", &self.tls)
            .field("status_codes", &self.status_codes)
            .field("status_predicate", &self.status_predicate.is_some())
            .field("body_predicate", &self.body_predicate.is_some())
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpProbe {
    /// Probe `path` with `GET` on the first exposed port.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Self {
            path,
            port: None,
            method: Method::GET,
            headers: Vec::new(),
            basic_auth: None,
            tls: false,
            allow_insecure: false,
            read_timeout: Duration::from_secs(1),
            status_codes: BTreeSet::new(),
            status_predicate: None,
            body_predicate: None,
            poll_interval: Duration::from_secs(1),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Probe this container port instead of the first exposed one.
    pub fn for_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use a different HTTP method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Send an extra request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Authenticate with HTTP basic credentials.
    pub fn with_basic_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    /// Use `https`.
    pub fn using_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Accept self-signed and otherwise invalid certificates.
    pub fn allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }

    /// Per-request timeout.
    ///
    /// # Errors
    ///
    /// [`CoreError::Precondition`] if `timeout` is under one millisecond.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout < Duration::from_millis(1) {
            return Err(CoreError::precondition(
                "read timeout must be at least 1 ms",
            ));
        }
        self.read_timeout = timeout;
        Ok(self)
    }

    /// Accept this status code. May be called repeatedly.
    pub fn for_status_code(mut self, code: u16) -> Self {
        self.status_codes.insert(code);
        self
    }

    /// Accept status codes matching `predicate`.
    pub fn for_status_code_matching(
        mut self,
        predicate: impl Fn(u16) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.status_predicate = Some(Arc::new(predicate));
        self
    }

    /// Also require the response body to satisfy `predicate`.
    pub fn for_response_predicate(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.body_predicate = Some(Arc::new(predicate));
        self
    }

    /// Minimum spacing between requests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn accepts_status(&self, code: u16) -> bool {
        if self.status_codes.is_empty() && self.status_predicate.is_none() {
            return code == 200;
        }
        self.status_codes.contains(&code)
            || self
                .status_predicate
                .as_ref()
                .map(|accept| accept(code))
                .unwrap_or(false)
    }

    fn uri(&self, host: &str, port: u16) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let default_port = if self.tls { 443 } else { 80 };
        if port == default_port {
            format!("{scheme}://{host}{}", self.path)
        } else {
            format!("{scheme}://{host}:{port}{}", self.path)
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CoreError::precondition(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CoreError::precondition(format!("invalid header value: {e}")))?;
            headers.append(name, value);
        }
        reqwest::Client::builder()
            .timeout(self.read_timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(self.allow_insecure)
            .build()
            .map_err(|e| CoreError::precondition(format!("cannot build HTTP client: {e}")))
    }

    async fn attempt(&self, client: &reqwest::Client, uri: &str) -> std::result::Result<(), String> {
        let mut request = client.request(self.method.clone(), uri);
        if let Some((username, password)) = &self.basic_auth {
            request = request.basic_auth(username, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("{uri}: {e}"))?;

        let status = response.status().as_u16();
        if !self.accepts_status(status) {
            return Err(format!("{uri}: unexpected status {status}"));
        }
        if let Some(accept) = &self.body_predicate {
            let body = response
                .text()
                .await
                .map_err(|e| format!("{uri}: reading body: {e}"))?;
            if !accept(&body) {
                return Err(format!("{uri}: response body rejected"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WaitStrategy for HttpProbe {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let handle = target.handle();
        let port = match self.port.or_else(|| handle.exposed_ports().first().copied()) {
            Some(port) => port,
            None => {
                return Err(CoreError::precondition(
                    "HTTP probe needs a port but the container exposes none",
                ))
            }
        };
        let uri = self.uri(handle.host(), handle.mapped_port(port)?);
        let client = self.client()?;
        tracing::debug!(
            container_id = %handle.id().short(),
            uri = %uri,
            method = %self.method,
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for HTTP endpoint"
        );

        let probe = Arc::new(self.clone());
        let throttle = Arc::new(Throttle::new(self.poll_interval));
        let target_uri = uri.clone();
        retry::until_success_or_deadline(self.startup_timeout, move || {
            let probe = probe.clone();
            let throttle = throttle.clone();
            let client = client.clone();
            let uri = target_uri.clone();
            async move { throttle.run(probe.attempt(&client, &uri)).await }
        })
        .await
        .map_err(|e| {
            exhausted(
                format!("{} {uri} never returned an accepted response", self.method),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchFailureKind;
    use crate::wait::testing::started;
    use berth_engine::scripted::ScriptedEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned responses, one per connection, repeating the last.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[n.min(responses.len() - 1)];
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (port, hits)
    }

    #[test]
    fn test_status_defaults_and_overrides() {
        let probe = HttpProbe::new("/health");
        assert!(probe.accepts_status(200));
        assert!(!probe.accepts_status(204));

        let probe = HttpProbe::new("/health")
            .for_status_code(204)
            .for_status_code_matching(|code| (500..600).contains(&code));
        assert!(!probe.accepts_status(200));
        assert!(probe.accepts_status(204));
        assert!(probe.accepts_status(503));
    }

    #[test]
    fn test_uri_elides_default_ports() {
        assert_eq!(
            HttpProbe::new("status").uri("localhost", 80),
            "http://localhost/status"
        );
        assert_eq!(
            HttpProbe::new("/").using_tls().uri("localhost", 443),
            "https://localhost/"
        );
        assert_eq!(
            HttpProbe::new("/").uri("127.0.0.1", 32768),
            "http://127.0.0.1:32768/"
        );
    }

    #[test]
    fn test_read_timeout_must_be_positive() {
        assert!(matches!(
            HttpProbe::new("/").with_read_timeout(Duration::from_micros(500)),
            Err(CoreError::Precondition(_))
        ));
        assert!(HttpProbe::new("/")
            .with_read_timeout(Duration::from_millis(1))
            .is_ok());
    }

    #[tokio::test]
    async fn test_retries_until_accepted() {
        let (port, hits) = serve(vec![(503, "starting"), (503, "starting"), (200, "ok")]).await;
        let engine = ScriptedEngine::new().with_port(8080, port);
        let target = started(&engine, &[8080]).await;

        HttpProbe::new("/ready")
            .with_poll_interval(Duration::from_millis(20))
            .with_startup_timeout(Duration::from_secs(5))
            .wait_until_ready(&target)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_body_predicate_gates_readiness() {
        let (port, _) = serve(vec![(200, "{\"status\":\"DOWN\"}"), (200, "{\"status\":\"UP\"}")]).await;
        let engine = ScriptedEngine::new().with_port(8080, port);
        let target = started(&engine, &[8080]).await;

        HttpProbe::new("/actuator/health")
            .for_response_predicate(|body| body.contains("UP"))
            .with_poll_interval(Duration::from_millis(20))
            .with_startup_timeout(Duration::from_secs(5))
            .wait_until_ready(&target)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_accepted_is_launch_failure() {
        let (port, _) = serve(vec![(500, "broken")]).await;
        let engine = ScriptedEngine::new().with_port(8080, port);
        let target = started(&engine, &[8080]).await;

        let err = HttpProbe::new("/")
            .with_poll_interval(Duration::from_millis(50))
            .with_startup_timeout(Duration::from_millis(400))
            .wait_until_ready(&target)
            .await
            .unwrap_err();
        assert_eq!(err.launch_kind(), Some(LaunchFailureKind::NeverReady));
        assert!(err.to_string().contains(&format!("GET http://127.0.0.1:{port}/")));
    }

    #[tokio::test]
    async fn test_no_port_is_precondition() {
        let engine = ScriptedEngine::new();
        let target = started(&engine, &[]).await;
        let err = HttpProbe::new("/").wait_until_ready(&target).await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }
}
