use super::{WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{CoreError, LaunchFailure, LaunchFailureKind, Result};
use crate::time_bound;
use async_trait::async_trait;
use futures::StreamExt;
use regex::{Regex, RegexBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ready once a regular expression has matched `times` lines of output.
///
/// The expression is case-insensitive and multi-line, and is matched
/// against each line of the combined stdout/stderr as it arrives.
#[derive(Debug, Clone)]
pub struct LogPattern {
    regex: Regex,
    times: usize,
    startup_timeout: Duration,
}

impl LogPattern {
    /// Wait for one line matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`CoreError::Precondition`] if `pattern` is not a valid expression.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map_err(|e| CoreError::precondition(format!("invalid log pattern: {e}")))?;
        Ok(Self {
            regex,
            times: 1,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        })
    }

    /// Require `times` matching lines (at least one).
    pub fn with_times(mut self, times: usize) -> Self {
        self.times = times.max(1);
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// The compiled expression.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// Splits a byte stream into lines and counts the ones matching.
struct LineMatcher {
    regex: Regex,
    pending: Vec<u8>,
    seen: Arc<AtomicUsize>,
}

impl LineMatcher {
    fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.check(&line);
        }
    }

    fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.check(&line);
        }
    }

    fn check(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n']);
        if self.regex.is_match(text) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WaitStrategy for LogPattern {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        let id = target.id().clone();
        tracing::debug!(
            container_id = %id.short(),
            pattern = %self.regex,
            times = self.times,
            timeout_ms = self.startup_timeout.as_millis() as u64,
            "Waiting for log output"
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let mut matcher = LineMatcher {
            regex: self.regex.clone(),
            pending: Vec::new(),
            seen: seen.clone(),
        };
        let times = self.times;
        let mut logs = target.engine().stream_logs(&id, true);

        let outcome = time_bound::run(self.startup_timeout, async move {
            while let Some(chunk) = logs.next().await {
                matcher.feed(&chunk?);
                if matcher.count() >= times {
                    return Ok(());
                }
            }
            matcher.finish();
            if matcher.count() >= times {
                return Ok(());
            }
            Err(CoreError::from(LaunchFailure::new(
                LaunchFailureKind::NeverReady,
                format!(
                    "log output ended after {} of {times} line(s) matching /{}/",
                    matcher.count(),
                    matcher.regex
                ),
            )))
        })
        .await;

        match outcome {
            Err(err @ CoreError::Timeout { .. }) => Err(LaunchFailure::new(
                LaunchFailureKind::NeverReady,
                format!(
                    "saw {} of {} line(s) matching /{}/ (waited {:?})",
                    seen.load(Ordering::SeqCst),
                    self.times,
                    self.regex,
                    self.startup_timeout
                ),
            )
            .with_source(err)
            .into()),
            other => other,
        }
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
    use crate::wait::testing::started;
    use berth_engine::scripted::ScriptedEngine;

    fn matcher(pattern: &str) -> LineMatcher {
        LineMatcher {
            regex: LogPattern::new(pattern).unwrap().regex,
            pending: Vec::new(),
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut m = matcher("ready to accept connections");
        m.feed(b"booting\nReady to ");
        assert_eq!(m.count(), 0);
        m.feed(b"accept connections\r\nready to accept");
        assert_eq!(m.count(), 1);
        m.finish();
        assert_eq!(m.count(), 1);
    }

    #[test]
    fn test_anchors_apply_per_line() {
        let mut m = matcher("^started$");
        m.feed(b"not started\nSTARTED\nstarted\n");
        assert_eq!(m.count(), 2);
    }

    #[test]
    fn test_invalid_pattern_is_precondition() {
        assert!(matches!(
            LogPattern::new("(unclosed"),
            Err(CoreError::Precondition(_))
        ));
        assert_eq!(LogPattern::new("x").unwrap().with_times(0).times, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_enough_matches() {
        let engine = ScriptedEngine::new()
            .with_logs(["starting up"])
            .with_repeating_log("I'm ready!", Duration::from_secs(1));
        let target = started(&engine, &[]).await;

        let started_at = tokio::time::Instant::now();
        LogPattern::new("I'm ready!")
            .unwrap()
            .with_times(2)
            .with_startup_timeout(Duration::from_secs(5))
            .wait_until_ready(&target)
            .await
            .unwrap();
        assert!(started_at.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_matches_seen() {
        let engine = ScriptedEngine::new()
            .with_repeating_log("I'm ready!", Duration::from_secs(1));
        let target = started(&engine, &[]).await;

        let err = LogPattern::new("I'm ready!")
            .unwrap()
            .with_times(5)
            .with_startup_timeout(Duration::from_millis(2500))
            .wait_until_ready(&target)
            .await
            .unwrap_err();

        assert_eq!(err.launch_kind(), Some(LaunchFailureKind::NeverReady));
        assert!(err.to_string().contains("saw 2 of 5"), "{err}");
    }

    #[tokio::test]
    async fn test_stream_end_fails_immediately() {
        let engine = ScriptedEngine::new().with_logs(["only line"]);
        let target = started(&engine, &[]).await;
        engine.kill_out_of_band(target.id(), 1);

        let err = LogPattern::new("never printed")
            .unwrap()
            .with_startup_timeout(Duration::from_secs(30))
            .wait_until_ready(&target)
            .await
            .unwrap_err();
        assert_eq!(err.launch_kind(), Some(LaunchFailureKind::NeverReady));
        assert!(err.to_string().contains("log output ended"), "{err}");
    }
}
