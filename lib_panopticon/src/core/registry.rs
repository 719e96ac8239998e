//! # Service Registry
//!
//! One [`ServiceSlot`] per source (the Lighthouse link, each monitor). The slot
//! is the only way to obtain the source's handle and it serializes the
//! lifecycle transitions:
//!
//! - `initialize` is get-or-create under an async mutex, so concurrent first
//!   callers share one instance.
//! - `stop` is guarded by a `stopping` flag; a second concurrent call sees the
//!   flag and returns at once. After a stop the slot is empty again and a later
//!   `initialize` builds a fresh instance.
//!
//! A handle is only ever obtained from an initialized slot, so operations that
//! need an initialized source simply live on the handle type.
//!
//! [`BackgroundTask`] is the piece every source uses for its own worker: one
//! spawned task plus the token that asks it to finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PanopticonError;

/// A long-running source managed by a [`ServiceSlot`].
pub trait ManagedService: Send + Sync + 'static {
    /// Begins background work. Calling it on a running service logs a warning.
    fn start(&self);

    /// Signals shutdown, cancels background work, waits for it and releases
    /// the connection. Must be safe to call on a service that never started.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

pub struct ServiceSlot<T> {
    name: &'static str,
    current: Mutex<Option<Arc<T>>>,
    stopping: AtomicBool,
}

/// Clears the stopping flag however the teardown ends.
struct StoppingGuard<'a>(&'a AtomicBool);

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: ManagedService> ServiceSlot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the live instance, building it with `build` if there is none.
    pub async fn initialize<F>(&self, build: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            return Arc::clone(existing);
        }
        let created = Arc::new(build());
        *current = Some(Arc::clone(&created));
        log::info!("{} initialized", self.name);
        created
    }

    /// The live instance, or `NotInitialized`.
    pub async fn get(&self) -> Result<Arc<T>, PanopticonError> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(PanopticonError::NotInitialized(self.name))
    }

    pub async fn is_initialized(&self) -> bool {
        self.current.lock().await.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Tears the instance down. Returns `true` if this call performed the
    /// teardown, `false` if another stop was in progress or nothing was running.
    pub async fn stop(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            log::debug!("{} is already stopping", self.name);
            return false;
        }
        let _guard = StoppingGuard(&self.stopping);

        let mut current = self.current.lock().await;
        let Some(service) = current.take() else {
            return false;
        };
        service.shutdown().await;
        log::info!("{} stopped", self.name);
        true
    }
}

/// At most one running worker task and its shutdown token.
#[derive(Default)]
pub struct BackgroundTask {
    running: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundTask {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawns `work` with a fresh token. Returns `false` and spawns nothing
    /// if a worker is still running.
    pub fn spawn<F, Fut>(&self, work: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return false;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(work(token.clone()));
        *slot = Some((token, handle));
        true
    }

    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Cancels the worker and detaches it from this task without waiting.
    /// A following `spawn` starts a fresh worker right away.
    pub fn take(&self) -> Option<StoppingWorker> {
        let (token, handle) = self.slot().take()?;
        token.cancel();
        Some(StoppingWorker { handle })
    }

    /// Cancels the worker and waits for it. A worker that has not returned
    /// within `grace` is aborted.
    pub async fn stop(&self, grace: Duration) {
        if let Some(worker) = self.take() {
            worker.join(grace).await;
        }
    }
}

/// A cancelled worker that may still be winding down.
pub struct StoppingWorker {
    handle: JoinHandle<()>,
}

impl StoppingWorker {
    pub async fn join(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            log::warn!("Background task ignored cancellation for {:?}, aborting", grace);
            self.handle.abort();
            let _ = self.handle.await;
        }
    }
}
