//! Retry a fallible operation until success, a deadline, or an attempt limit.
//!
//! Every error returned by the operation is treated as retryable; only
//! running out of time ([`CoreError::Timeout`]) or attempts
//! ([`CoreError::RetryExhausted`]) ends the loop with a failure, and both
//! chain the last failure the operation reported.

use crate::error::{BoxError, CoreError, Result};
use crate::time_bound;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Error recorded when a boolean condition is still false.
#[derive(Debug, thiserror::Error)]
#[error("condition not satisfied yet")]
pub struct NotReady;

/// Invoke `op` until it succeeds or `deadline` passes.
///
/// The loop runs through [`time_bound::run`], so the deadline holds even if
/// one attempt hangs. Once the deadline has passed no further attempt starts.
///
/// # Errors
///
/// [`CoreError::Timeout`] carrying the last error `op` returned.
pub async fn until_success_or_deadline<F, Fut, T, E>(deadline: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
    T: Send + 'static,
    E: Into<BoxError> + Send,
{
    let last_error: Arc<Mutex<Option<BoxError>>> = Arc::default();
    let done = Arc::new(AtomicBool::new(false));
    let _done_guard = SetOnDrop(done.clone());

    let slot = last_error.clone();
    let result = time_bound::run(deadline, async move {
        let mut attempt: u32 = 0;
        loop {
            if done.load(Ordering::SeqCst) {
                return Err(CoreError::Timeout {
                    waited: deadline,
                    last_error: None,
                });
            }
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err: BoxError = err.into();
                    trace!(attempt, error = %err, "Attempt failed");
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                }
            }
            tokio::task::yield_now().await;
        }
    })
    .await;

    match result {
        Err(CoreError::Timeout { waited, .. }) => Err(CoreError::Timeout {
            waited,
            last_error: last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        }),
        other => other,
    }
}

/// Invoke `op` up to `max_attempts` times, stopping at the first success.
///
/// Attempts run back to back on the caller's task.
///
/// # Errors
///
/// - [`CoreError::Precondition`] if `max_attempts` is zero
/// - [`CoreError::RetryExhausted`] carrying the last error `op` returned
pub async fn until_success_or_attempts<F, Fut, T, E>(max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    if max_attempts == 0 {
        return Err(CoreError::precondition("max_attempts must be at least 1"));
    }

    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let err: BoxError = err.into();
                trace!(attempt, max_attempts, error = %err, "Attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(CoreError::RetryExhausted {
        attempts: max_attempts,
        last_error,
    })
}

/// Invoke `op` until it returns `true` or `deadline` passes.
pub async fn until_true_or_deadline<F, Fut>(deadline: Duration, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    until_success_or_deadline(deadline, move || {
        let check = op();
        async move { check.await.then_some(()).ok_or(NotReady) }
    })
    .await
}

/// Invoke `op` until it returns `true`, at most `max_attempts` times.
pub async fn until_true_or_attempts<F, Fut>(max_attempts: u32, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    until_success_or_attempts(max_attempts, move || {
        let check = op();
        async move { check.await.then_some(()).ok_or(NotReady) }
    })
    .await
}

/// Marks the retry loop finished when the waiting caller returns or is dropped.
struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
