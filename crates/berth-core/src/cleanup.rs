//! Deferred cleanup actions run when the process shuts down.
//!
//! Controllers register an action that stops their container; the host
//! runtime runs the registry on shutdown. Actions run in reverse
//! registration order, each at most once.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::{self, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Receipt for a registered action, used to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupToken(u64);

struct Entry {
    token: CleanupToken,
    label: String,
    action: CleanupAction,
}

#[derive(Default)]
struct RegistryInner {
    next_token: u64,
    entries: Vec<Entry>,
}

/// Ordered list of labelled cleanup actions.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl CleanupRegistry {
    /// Empty registry, independent of the global one.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static CleanupRegistry {
        static GLOBAL: OnceLock<CleanupRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CleanupRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `action` under `label`.
    pub fn register<F, Fut>(&self, label: impl Into<String>, action: F) -> CleanupToken
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        inner.next_token += 1;
        let token = CleanupToken(inner.next_token);
        let label = label.into();
        debug!(label = %label, "Registered cleanup action");
        inner.entries.push(Entry {
            token,
            label,
            action: Box::new(move || action().boxed()),
        });
        token
    }

    /// Drop a registered action without running it.
    ///
    /// Returns false if it already ran or was deregistered.
    pub fn deregister(&self, token: CleanupToken) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.token != token);
        inner.entries.len() != before
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending action once `signal` resolves.
    pub fn run_on<S>(&self, signal: S) -> JoinHandle<usize>
    where
        S: Future + Send + 'static,
    {
        let registry = self.clone();
        tokio::spawn(async move {
            signal.await;
            info!("Shutdown signal received, cleaning up containers");
            registry.run_all().await
        })
    }

    /// Run every pending action, newest first. Returns how many ran.
    pub async fn run_all(&self) -> usize {
        let entries = std::mem::take(&mut self.lock().entries);
        let count = entries.len();
        if count > 0 {
            info!(count, "Running cleanup actions");
        }
        for entry in entries.into_iter().rev() {
            debug!(label = %entry.label, "Running cleanup action");
            (entry.action)().await;
        }
        count
    }
}

/// Run the global registry when the process receives Ctrl-C, then exit
/// with status 130.
///
/// Installing more than once has no effect; returns the hook task on the
/// first call.
pub fn install_shutdown_hook() -> Option<JoinHandle<()>> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return None;
    }

    let cleanup = CleanupRegistry::global().run_on(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for Ctrl-C; shutdown hook disabled");
            future::pending::<()>().await;
        }
    });
    Some(tokio::spawn(async move {
        if cleanup.await.is_ok() {
            crate::time_bound::shutdown();
            std::process::exit(130);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, ()> {
        let log = log.clone();
        move || async move { log.lock().unwrap().push(name) }.boxed()
    }

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let registry = CleanupRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("first", recorder(&log, "first"));
        registry.register("second", recorder(&log, "second"));
        registry.register("third", recorder(&log, "third"));

        assert_eq!(registry.run_all().await, 3);
        assert_eq!(*log.lock().unwrap(), ["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_each_action_runs_once() {
        let registry = CleanupRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        registry.register("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.run_all().await, 1);
        assert_eq!(registry.run_all().await, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_deregistered_action_never_runs() {
        let registry = CleanupRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let kept = registry.register("kept", recorder(&log, "kept"));
        let dropped = registry.register("dropped", recorder(&log, "dropped"));

        assert!(registry.deregister(dropped));
        assert!(!registry.deregister(dropped));
        assert_eq!(registry.len(), 1);

        registry.run_all().await;
        assert_eq!(*log.lock().unwrap(), ["kept"]);
        assert!(!registry.deregister(kept));
    }

    #[tokio::test]
    async fn test_runs_when_signalled() {
        let registry = CleanupRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("stop", recorder(&log, "stop"));
        let (signal, received) = tokio::sync::oneshot::channel::<()>();

        let task = registry.run_on(async move {
            let _ = received.await;
        });
        tokio::task::yield_now().await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.len(), 1);

        signal.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), ["stop"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_hook_installs_once() {
        let first = install_shutdown_hook();
        assert!(install_shutdown_hook().is_none());
        if let Some(hook) = first {
            assert!(!hook.is_finished());
            hook.abort();
        }
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(CleanupRegistry::global(), CleanupRegistry::global()));
    }
}
