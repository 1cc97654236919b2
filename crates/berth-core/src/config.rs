//! Settings and per-container configuration.
//!
//! Process-wide settings come from environment variables with sensible
//! defaults; per-container configuration is built once and moved into the
//! controller.

use crate::error::{CoreError, Result};
use crate::wait::{PortOpen, WaitStrategy};
use berth_engine::ContainerRequest;
use std::sync::OnceLock;
use std::time::Duration;
use uuid::Uuid;

/// Label marking a container as managed by berth.
pub const MANAGED_LABEL: &str = "org.berth.managed";

/// Label carrying the id of the process session that created a container.
pub const SESSION_LABEL: &str = "org.berth.session-id";

/// Identifier shared by every container this process creates.
pub fn session_id() -> &'static str {
    static SESSION: OnceLock<String> = OnceLock::new();
    SESSION.get_or_init(|| Uuid::new_v4().to_string())
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerthSettings {
    /// Skip the exit watcher and cleanup-hook registration (default: false).
    pub reaper_disabled: bool,

    /// Startup timeout of the default wait strategy (default: 60s).
    pub startup_timeout: Duration,

    /// Whole-start attempts (default: 1).
    pub startup_attempts: u32,

    /// Bound of the shared worker pool (default: 256).
    pub worker_pool_size: usize,

    /// Host used for port resolution instead of the engine's own.
    pub host_override: Option<String>,

    /// Grace period given to a stopping container before it is killed
    /// (default: 0s).
    pub stop_grace: Duration,
}

impl Default for BerthSettings {
    fn default() -> Self {
        Self {
            reaper_disabled: false,
            startup_timeout: Duration::from_secs(60),
            startup_attempts: 1,
            worker_pool_size: 256,
            host_override: None,
            stop_grace: Duration::ZERO,
        }
    }
}

impl BerthSettings {
    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BERTH_REAPER_DISABLED` | `false` |
    /// | `BERTH_STARTUP_TIMEOUT_SECS` | `60` |
    /// | `BERTH_STARTUP_ATTEMPTS` | `1` |
    /// | `BERTH_WORKER_POOL_SIZE` | `256` |
    /// | `BERTH_HOST_OVERRIDE` | unset |
    /// | `BERTH_STOP_GRACE_SECS` | `0` |
    ///
    /// Values that fail to parse fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            reaper_disabled: lookup("BERTH_REAPER_DISABLED")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default.reaper_disabled),
            startup_timeout: parsed("BERTH_STARTUP_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(default.startup_timeout),
            startup_attempts: parsed("BERTH_STARTUP_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(default.startup_attempts),
            worker_pool_size: parsed("BERTH_WORKER_POOL_SIZE")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(default.worker_pool_size),
            host_override: lookup("BERTH_HOST_OVERRIDE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            stop_grace: parsed("BERTH_STOP_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.stop_grace),
        }
    }
}

/// Everything needed to launch one container.
///
/// Built once with [`ContainerConfig::builder`]; the controller owns it from
/// then on, so a strategy cannot be reconfigured while it is waiting.
#[derive(Debug)]
pub struct ContainerConfig {
    pub(crate) request: ContainerRequest,
    pub(crate) wait: Box<dyn WaitStrategy>,
    pub(crate) startup_attempts: u32,
    pub(crate) settings: BerthSettings,
}

impl ContainerConfig {
    /// Start building a configuration for `request`.
    pub fn builder(request: ContainerRequest) -> ContainerConfigBuilder {
        ContainerConfigBuilder {
            request,
            wait: None,
            startup_attempts: None,
            startup_timeout: None,
            settings: None,
        }
    }

    /// The container request, including session labels.
    pub fn request(&self) -> &ContainerRequest {
        &self.request
    }

    /// The readiness strategy.
    pub fn wait_strategy(&self) -> &dyn WaitStrategy {
        self.wait.as_ref()
    }

    /// Whole-start attempts.
    pub fn startup_attempts(&self) -> u32 {
        self.startup_attempts
    }

    /// Settings in effect.
    pub fn settings(&self) -> &BerthSettings {
        &self.settings
    }
}

/// Builder for [`ContainerConfig`].
#[derive(Debug)]
pub struct ContainerConfigBuilder {
    request: ContainerRequest,
    wait: Option<Box<dyn WaitStrategy>>,
    startup_attempts: Option<u32>,
    startup_timeout: Option<Duration>,
    settings: Option<BerthSettings>,
}

impl ContainerConfigBuilder {
    /// Readiness strategy (default: every exposed port open).
    pub fn wait_for(self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait_for_boxed(Box::new(strategy))
    }

    /// Readiness strategy, already boxed.
    pub fn wait_for_boxed(mut self, strategy: Box<dyn WaitStrategy>) -> Self {
        self.wait = Some(strategy);
        self
    }

    /// Whole-start attempts (default: from settings).
    pub fn startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = Some(attempts);
        self
    }

    /// Override the strategy's startup timeout.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Settings to use instead of [`BerthSettings::from_env`].
    pub fn settings(mut self, settings: BerthSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Validate and finish.
    ///
    /// # Errors
    ///
    /// [`CoreError::Precondition`] for an invalid request, zero attempts or
    /// a zero startup timeout.
    pub fn build(self) -> Result<ContainerConfig> {
        let settings = self.settings.unwrap_or_else(BerthSettings::from_env);

        let mut request = self.request;
        request
            .validate()
            .map_err(|e| CoreError::precondition(e.to_string()))?;
        request
            .labels
            .insert(MANAGED_LABEL.to_string(), "true".to_string());
        request
            .labels
            .insert(SESSION_LABEL.to_string(), session_id().to_string());

        let startup_attempts = self.startup_attempts.unwrap_or(settings.startup_attempts);
        if startup_attempts == 0 {
            return Err(CoreError::precondition("startup attempts must be at least 1"));
        }

        let mut wait = self.wait.unwrap_or_else(|| {
            Box::new(PortOpen::new().with_startup_timeout(settings.startup_timeout))
        });
        if let Some(timeout) = self.startup_timeout {
            if timeout.is_zero() {
                return Err(CoreError::precondition("startup timeout must be greater than zero"));
            }
            wait.set_startup_timeout(timeout)?;
        }

        Ok(ContainerConfig {
            request,
            wait,
            startup_attempts,
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{CompositeWait, LogPattern, TimeoutMode};
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> BerthSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BerthSettings::from_lookup(|key| vars.get(key).cloned())
    }

    fn request() -> ContainerRequest {
        ContainerRequest::builder("redis:7").expose(6379).build().unwrap()
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(settings(&[]), BerthSettings::default());
    }

    #[test]
    fn test_env_overrides() {
        let s = settings(&[
            ("BERTH_REAPER_DISABLED", "TRUE"),
            ("BERTH_STARTUP_TIMEOUT_SECS", "5"),
            ("BERTH_STARTUP_ATTEMPTS", "3"),
            ("BERTH_WORKER_POOL_SIZE", "8"),
            ("BERTH_HOST_OVERRIDE", "docker.internal"),
            ("BERTH_STOP_GRACE_SECS", "2"),
        ]);
        assert!(s.reaper_disabled);
        assert_eq!(s.startup_timeout, Duration::from_secs(5));
        assert_eq!(s.startup_attempts, 3);
        assert_eq!(s.worker_pool_size, 8);
        assert_eq!(s.host_override.as_deref(), Some("docker.internal"));
        assert_eq!(s.stop_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let s = settings(&[
            ("BERTH_STARTUP_TIMEOUT_SECS", "soon"),
            ("BERTH_STARTUP_ATTEMPTS", "0"),
            ("BERTH_WORKER_POOL_SIZE", "-1"),
            ("BERTH_HOST_OVERRIDE", "  "),
        ]);
        assert_eq!(s, BerthSettings::default());
    }

    #[test]
    fn test_build_labels_request_and_defaults_wait() {
        let config = ContainerConfig::builder(request())
            .settings(BerthSettings {
                startup_timeout: Duration::from_secs(12),
                ..BerthSettings::default()
            })
            .build()
            .unwrap();

        let labels = &config.request().labels;
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(SESSION_LABEL).map(String::as_str), Some(session_id()));
        assert_eq!(config.wait_strategy().startup_timeout(), Duration::from_secs(12));
        assert_eq!(config.startup_attempts(), 1);
    }

    #[test]
    fn test_startup_timeout_overrides_strategy() {
        let config = ContainerConfig::builder(request())
            .settings(BerthSettings::default())
            .wait_for(LogPattern::new("ready").unwrap())
            .startup_timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(config.wait_strategy().startup_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let zero_attempts = ContainerConfig::builder(request())
            .settings(BerthSettings::default())
            .startup_attempts(0)
            .build();
        assert!(matches!(zero_attempts, Err(CoreError::Precondition(_))));

        let individual = ContainerConfig::builder(request())
            .settings(BerthSettings::default())
            .wait_for(CompositeWait::new(TimeoutMode::IndividualTimeoutsOnly))
            .startup_timeout(Duration::from_secs(3))
            .build();
        assert!(matches!(individual, Err(CoreError::Precondition(_))));
    }
}
