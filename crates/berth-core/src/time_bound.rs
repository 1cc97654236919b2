//! Bounded execution of a unit of work on a shared worker pool.
//!
//! [`run`] dispatches a future onto the process-wide [`WorkerPool`] and
//! waits at most `deadline` for it. The work runs on its own task, so the
//! deadline holds even when the work never yields a result; on expiry the
//! task is aborted and its result, if any, is never observed.
//!
//! The pool is created on first use and closed once by [`shutdown`]
//! (normally through [`crate::teardown`]).

use crate::config::BerthSettings;
use crate::error::{CoreError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

static GLOBAL_POOL: OnceLock<WorkerPool> = OnceLock::new();

// ============================================================================
// Worker Pool
// ============================================================================

/// Bounded pool of tasks executing time-bound work.
///
/// At most `size` units of work execute at once; further work queues for a
/// permit, and the queueing time counts against its deadline.
#[derive(Debug)]
pub struct WorkerPool {
    /// Limits concurrently executing work.
    permits: Arc<Semaphore>,
    /// Flipped to `true` on shutdown; every in-flight task watches it.
    shutdown: watch::Sender<bool>,
    /// Work currently dispatched and not yet finished.
    in_flight: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` units of work concurrently.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        tracing::debug!(size, "Creating worker pool");
        let (shutdown, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            shutdown,
            in_flight: Arc::new(AtomicUsize::new(0)),
            size,
        }
    }

    /// The process-wide pool, created on first use.
    ///
    /// Its size comes from `BERTH_WORKER_POOL_SIZE`.
    pub fn global() -> &'static WorkerPool {
        GLOBAL_POOL.get_or_init(|| WorkerPool::new(BerthSettings::from_env().worker_pool_size))
    }

    /// Maximum number of concurrently executing units of work.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of dispatched units of work that have not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Close the pool: in-flight work is cancelled with
    /// [`CoreError::PoolShutdown`] and new work is rejected.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.permits.close();
        tracing::debug!(in_flight = self.in_flight(), "Worker pool shut down");
    }

    /// Run `task` on the pool, waiting at most `deadline` for its result.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Precondition`] if `deadline` is zero
    /// - [`CoreError::Timeout`] if the deadline expires (the task is aborted)
    /// - [`CoreError::PoolShutdown`] if the pool is or gets shut down
    /// - the task's own error, converted into [`CoreError`]
    ///
    /// A panic inside `task` is resumed on the caller.
    pub async fn run<F, T, E>(&self, deadline: Duration, task: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<CoreError> + Send + 'static,
    {
        if deadline.is_zero() {
            return Err(CoreError::precondition("deadline must be greater than zero"));
        }
        if self.is_shut_down() {
            return Err(CoreError::PoolShutdown);
        }

        let permits = self.permits.clone();
        let mut shutdown = self.shutdown.subscribe();
        let in_flight = InFlight::enter(self.in_flight.clone());

        let handle = tokio::spawn(async move {
            let _in_flight = in_flight;
            let work = async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| CoreError::PoolShutdown)?;
                task.await.map_err(Into::into)
            };
            tokio::select! {
                biased;
                _ = closed(&mut shutdown) => Err(CoreError::PoolShutdown),
                result = work => result,
            }
        });
        let mut task = AbortOnDrop(handle);

        match tokio::time::timeout(deadline, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Ok(Err(_)) => Err(CoreError::PoolShutdown),
            Err(_) => {
                task.0.abort();
                tracing::trace!(deadline_ms = deadline.as_millis() as u64, "Deadline expired");
                Err(CoreError::Timeout {
                    waited: deadline,
                    last_error: None,
                })
            }
        }
    }
}

/// Resolves once the pool is shut down or dropped.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Aborts the spawned task when the waiting caller goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Free functions over the global pool
// ============================================================================

/// Run `task` on the global pool, waiting at most `deadline`.
///
/// See [`WorkerPool::run`].
pub async fn run<F, T, E>(deadline: Duration, task: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<CoreError> + Send + 'static,
{
    WorkerPool::global().run(deadline, task).await
}

/// Wait at most `deadline` for a future that borrows from the caller.
///
/// The future runs on the caller's task; it is dropped on expiry.
pub async fn run_in_place<F, T>(deadline: Duration, task: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if deadline.is_zero() {
        return Err(CoreError::precondition("deadline must be greater than zero"));
    }
    match tokio::time::timeout(deadline, task).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            waited: deadline,
            last_error: None,
        }),
    }
}

/// Shut the global pool down, if it was ever created.
pub fn shutdown() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[tokio::test]
    async fn test_returns_result_within_deadline() {
        let pool = WorkerPool::new(4);
        let value = pool
            .run(Duration::from_secs(1), async { Ok::<_, CoreError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_task_error_is_surfaced_unwrapped() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run(Duration::from_secs(1), async {
                Err::<(), _>(CoreError::precondition("bad input"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(msg) if msg == "bad input"));
    }

    #[tokio::test]
    async fn test_zero_deadline_fails_fast() {
        let pool = WorkerPool::new(1);
        let started = Instant::now();
        let err = pool
            .run(Duration::ZERO, std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_aborts_task() {
        let pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let err = pool
            .run(Duration::from_millis(500), async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_work_counts_against_deadline() {
        let pool = Arc::new(WorkerPool::new(1));
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(Duration::from_secs(10), async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CoreError>(())
                })
                .await
            })
        };
        while pool.permits.available_permits() > 0 {
            tokio::task::yield_now().await;
        }

        let err = pool
            .run(Duration::from_secs(1), async { Ok::<_, CoreError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        busy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_cancels() {
        let pool = Arc::new(WorkerPool::new(2));
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(Duration::from_secs(30), std::future::pending::<Result<()>>())
                    .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(matches!(pending.await.unwrap(), Err(CoreError::PoolShutdown)));
        assert!(matches!(
            pool.run(Duration::from_secs(1), async { Ok::<_, CoreError>(()) })
                .await,
            Err(CoreError::PoolShutdown)
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn test_panic_is_resumed_on_caller() {
        let pool = WorkerPool::new(1);
        let _ = pool
            .run(Duration::from_secs(1), async {
                if true {
                    panic!("boom");
                }
                Ok::<_, CoreError>(())
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_in_place_times_out() {
        let err = run_in_place(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { waited, .. } if waited == Duration::from_secs(2)));
    }
}
