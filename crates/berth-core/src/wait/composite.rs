use super::{WaitStrategy, WaitTarget};
use crate::error::{CoreError, LaunchFailure, LaunchFailureKind, Result};
use crate::time_bound;
use async_trait::async_trait;
use std::time::Duration;

/// Outer timeout of a shared-mode composite that was not given one.
pub const DEFAULT_OUTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Who owns timing in a [`CompositeWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// One outer timeout, pushed onto every child and enforced as a ceiling
    /// over the whole sequence.
    SharedOuterTimeout,
    /// Children keep their own timeouts; there is no ceiling.
    IndividualTimeoutsOnly,
}

/// Runs child strategies one after another, stopping at the first failure.
///
/// In [`TimeoutMode::SharedOuterTimeout`] every child is given the outer
/// timeout whenever a child is added or the outer timeout changes, and the
/// whole run is additionally bounded by it.
#[derive(Debug)]
pub struct CompositeWait {
    mode: TimeoutMode,
    outer_timeout: Duration,
    children: Vec<Box<dyn WaitStrategy>>,
}

impl CompositeWait {
    /// Empty composite; shared mode starts from [`DEFAULT_OUTER_TIMEOUT`].
    pub fn new(mode: TimeoutMode) -> Self {
        Self {
            mode,
            outer_timeout: DEFAULT_OUTER_TIMEOUT,
            children: Vec::new(),
        }
    }

    /// Who owns timing.
    pub fn mode(&self) -> TimeoutMode {
        self.mode
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True without children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Append a child strategy.
    pub fn with_strategy(mut self, strategy: impl WaitStrategy + 'static) -> Result<Self> {
        self.add(Box::new(strategy))?;
        Ok(self)
    }

    /// Append a boxed child strategy.
    ///
    /// # Errors
    ///
    /// In [`TimeoutMode::SharedOuterTimeout`], whatever the child returns
    /// when handed the outer timeout; the child is not added.
    pub fn add(&mut self, mut strategy: Box<dyn WaitStrategy>) -> Result<()> {
        if self.mode == TimeoutMode::SharedOuterTimeout {
            strategy.set_startup_timeout(self.outer_timeout)?;
        }
        self.children.push(strategy);
        Ok(())
    }

    /// Set the outer timeout.
    ///
    /// # Errors
    ///
    /// [`CoreError::Precondition`] in [`TimeoutMode::IndividualTimeoutsOnly`];
    /// no child is touched.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.set_startup_timeout(timeout)?;
        Ok(self)
    }

    fn redistribute(&mut self) -> Result<()> {
        let outer = self.outer_timeout;
        for child in &mut self.children {
            child.set_startup_timeout(outer)?;
        }
        Ok(())
    }

    async fn run_children(&self, target: &WaitTarget) -> Result<()> {
        for (index, child) in self.children.iter().enumerate() {
            tracing::debug!(
                container_id = %target.id().short(),
                index,
                strategy = ?child,
                "Running composite child"
            );
            child.wait_until_ready(target).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WaitStrategy for CompositeWait {
    async fn wait_until_ready(&self, target: &WaitTarget) -> Result<()> {
        if self.children.is_empty() {
            return Ok(());
        }
        match self.mode {
            TimeoutMode::IndividualTimeoutsOnly => self.run_children(target).await,
            TimeoutMode::SharedOuterTimeout => {
                time_bound::run_in_place(self.outer_timeout, self.run_children(target))
                    .await
                    .map_err(|err| match err {
                        CoreError::Timeout { .. } => LaunchFailure::new(
                            LaunchFailureKind::CompositeTimeout,
                            format!(
                                "{} strategies did not all succeed within {:?}",
                                self.children.len(),
                                self.outer_timeout
                            ),
                        )
                        .with_source(err)
                        .into(),
                        other => other,
                    })
            }
        }
    }

    fn startup_timeout(&self) -> Duration {
        match self.mode {
            TimeoutMode::SharedOuterTimeout => self.outer_timeout,
            TimeoutMode::IndividualTimeoutsOnly => self
                .children
                .iter()
                .map(|child| child.startup_timeout())
                .sum(),
        }
    }

    fn set_startup_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.mode == TimeoutMode::IndividualTimeoutsOnly {
            return Err(CoreError::precondition(
                "cannot set an outer timeout on a composite using individual timeouts",
            ));
        }
        self.outer_timeout = timeout;
        self.redistribute()
    }

    fn requires_running(&self) -> bool {
        self.children.iter().all(|child| child.requires_running())
    }
}
