//! # Store Poll Monitor
//!
//! A self-scheduling poller over a [`KeyedStore`], shared by the health-pool
//! scanner and the stream-tail monitor. Each tick it makes sure a connection
//! exists, runs the source's fetch once and publishes the result.
//!
//! ## Key Design Principles:
//! - **Push-driven**: the poll loop only runs while the monitor has
//!   subscribers. The first `subscribe` starts it; the last `unsubscribe`
//!   stops it and drops the connection.
//! - **Resilience**: a failed fetch is logged, the connection is discarded
//!   and the next tick reconnects through `connect_with_retry`. Nothing in the
//!   loop is fatal.
//! - **Change rule**: a source either republishes every tick or only when its
//!   result differs from the previous one.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::channel::{Channel, ChannelValue};
use crate::core::dispatcher::{Dispatcher, SubscriberId};
use crate::core::registry::{BackgroundTask, ManagedService};
use crate::core::retry::{sleep_or_shutdown, RetryPacer, RetryPolicy};
use crate::core::status::{ConnectionStatus, ErrorKind, StatusCell};
use crate::error::{StoreError, SubscriberError};
use crate::ingestors::store::{KeyedStore, StoreConnector};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// What a monitor fetches and where it publishes it.
pub trait PollSource: Send + Sync + 'static {
    type Output: PartialEq + Send + Sync + 'static;

    /// Name used in logs and `NotInitialized` errors.
    const NAME: &'static str;
    const CHANNEL: Channel;
    /// Publish on every tick, not only when the result changed.
    const PUBLISH_UNCHANGED: bool;

    /// One poll. `Ok(None)` means there is nothing to publish this tick.
    fn fetch<S: KeyedStore>(&self, store: &mut S) -> impl Future<Output = Result<Option<Self::Output>, StoreError>> + Send;

    fn to_value(output: &Arc<Self::Output>) -> ChannelValue;
}

/// Poll tuning, usually taken from [`RedisSettings`](crate::configs::settings::RedisSettings).
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub retry: RetryPolicy,
    /// `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl PollOptions {
    pub fn from_settings(settings: &crate::configs::settings::RedisSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            retry: settings.retry_policy(),
            max_connect_attempts: settings.max_connect_attempts,
        }
    }
}

struct MonitorInner<P: PollSource, C: StoreConnector> {
    source: P,
    connector: C,
    options: PollOptions,
    status: StatusCell,
    pacer: tokio::sync::Mutex<RetryPacer>,
    latest: RwLock<Option<Arc<P::Output>>>,
    dispatcher: Arc<Dispatcher>,
    /// Held by the live poll loop; a restarted loop waits for the old one to exit.
    run_lock: tokio::sync::Mutex<()>,
}

pub struct PollMonitor<P: PollSource, C: StoreConnector> {
    inner: Arc<MonitorInner<P, C>>,
    task: BackgroundTask,
    subscribers: Mutex<Vec<SubscriberId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<P: PollSource, C: StoreConnector> PollMonitor<P, C> {
    pub fn new(source: P, connector: C, options: PollOptions, dispatcher: Arc<Dispatcher>) -> Self {
        let status = StatusCell::new(ConnectionStatus::new(connector.uri(), options.retry.min_interval));
        Self {
            inner: Arc::new(MonitorInner {
                source,
                connector,
                options,
                status,
                pacer: tokio::sync::Mutex::new(RetryPacer::new(options.retry)),
                latest: RwLock::new(None),
                dispatcher,
                run_lock: tokio::sync::Mutex::new(()),
            }),
            task: BackgroundTask::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.snapshot()
    }

    /// Last fetched result, whether or not it was published.
    pub fn latest(&self) -> Option<Arc<P::Output>> {
        self.inner.latest_value()
    }

    pub fn is_polling(&self) -> bool {
        self.task.is_running()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Connects, retrying every retry interval until it succeeds, `shutdown`
    /// fires or `max_connect_attempts` attempts have failed.
    pub async fn connect_with_retry(&self, shutdown: &CancellationToken) -> Result<C::Store, StoreError> {
        self.inner.connect_with_retry(shutdown).await
    }

    /// # Subscribe
    ///
    /// Registers `callback` on the monitor's channel and starts polling if
    /// this is the first subscriber.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ChannelValue) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = self.inner.dispatcher.register(P::CHANNEL, callback);
        let mut subscribers = lock(&self.subscribers);
        subscribers.push(id);
        if subscribers.len() == 1 {
            self.start();
        }
        id
    }

    /// # Unsubscribe
    ///
    /// Removes a subscriber. When the last one leaves the poll loop is stopped
    /// and its connection released. Returns `false` for unknown ids.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        // The worker is detached under the same lock `subscribe` starts it
        // under, so a concurrent first subscriber always gets a fresh loop.
        let stopping = {
            let mut subscribers = lock(&self.subscribers);
            let before = subscribers.len();
            subscribers.retain(|s| *s != id);
            if subscribers.len() == before {
                return false;
            }
            self.inner.dispatcher.unregister(P::CHANNEL, id);
            if subscribers.is_empty() {
                self.task.take()
            } else {
                None
            }
        };
        if let Some(worker) = stopping {
            log::info!("{}: last subscriber left, stopping poll loop", P::NAME);
            worker.join(STOP_GRACE).await;
        }
        true
    }
}

impl<P: PollSource, C: StoreConnector> MonitorInner<P, C> {
    fn latest_value(&self) -> Option<Arc<P::Output>> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn connect_with_retry(&self, shutdown: &CancellationToken) -> Result<C::Store, StoreError> {
        let uri = self.connector.uri();
        let mut pacer = self.pacer.lock().await;
        let mut failures: u32 = 0;
        loop {
            if !pacer.wait_turn(shutdown).await {
                return Err(StoreError::Cancelled(uri));
            }
            if let Some(at) = pacer.last_attempt() {
                self.status.update(|s| s.attempting(at));
            }
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Err(StoreError::Cancelled(uri)),
                result = self.connector.connect() => result,
            };
            match attempt {
                Ok(store) => {
                    let delay = self.options.retry.min_interval;
                    self.status.update(|s| s.connected_at(Utc::now(), delay));
                    log::info!("{}: connected to {}", P::NAME, uri);
                    return Ok(store);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let kind = match e {
                        StoreError::Timeout(_) => ErrorKind::Timeout,
                        _ => ErrorKind::StoreUnavailable,
                    };
                    let delay = self.options.retry.delay_for(failures);
                    self.status.update(|s| s.retrying(kind, delay, Utc::now()));
                    if self.options.max_connect_attempts.is_some_and(|max| failures >= max) {
                        log::error!("{}: giving up on {} after {} attempts: {}", P::NAME, uri, failures, e);
                        return Err(StoreError::RetriesExhausted { uri, attempts: failures });
                    }
                    log::warn!(
                        "{}: connection attempt {} to {} failed: {}. Retrying in {:.1}s",
                        P::NAME,
                        failures,
                        uri,
                        e,
                        delay.as_secs_f64()
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return Err(StoreError::Cancelled(uri));
                    }
                }
            }
        }
    }

    fn offer(&self, output: P::Output) {
        let output = Arc::new(output);
        let changed = {
            let mut latest = match self.latest.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = latest.as_deref() != Some(&*output);
            *latest = Some(Arc::clone(&output));
            changed
        };
        if changed || P::PUBLISH_UNCHANGED {
            self.dispatcher.publish(P::CHANNEL, P::to_value(&output));
        }
    }

    /// # Main Poll Loop
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let _running = tokio::select! {
            _ = shutdown.cancelled() => return,
            guard = self.run_lock.lock() => guard,
        };
        log::info!("{}: poll loop started ({:?})", P::NAME, self.options.interval);
        let mut store: Option<C::Store> = None;

        while !shutdown.is_cancelled() {
            if store.is_none() {
                match self.connect_with_retry(&shutdown).await {
                    Ok(connected) => store = Some(connected),
                    Err(StoreError::Cancelled(_)) => break,
                    Err(e) => log::error!("{}: {}", P::NAME, e),
                }
            }

            if let Some(conn) = store.as_mut() {
                let fetched = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = self.source.fetch(conn) => result,
                };
                match fetched {
                    Ok(Some(output)) => self.offer(output),
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("{}: poll failed, dropping connection: {}", P::NAME, e);
                        store = None;
                        self.status
                            .update(|s| s.failed_at(ErrorKind::ConnectionLost, Utc::now()).disconnected());
                    }
                }
            }

            if !sleep_or_shutdown(self.options.interval, &shutdown).await {
                break;
            }
        }

        drop(store);
        self.status.update(ConnectionStatus::disconnected);
        log::info!("{}: poll loop stopped", P::NAME);
    }
}

impl<P: PollSource, C: StoreConnector> ManagedService for PollMonitor<P, C> {
    fn start(&self) {
        let inner = Arc::clone(&self.inner);
        if !self.task.spawn(move |token| inner.run(token)) {
            log::warn!("{} is already polling", P::NAME);
        }
    }

    async fn shutdown(&self) {
        let stopping = {
            let mut subscribers = lock(&self.subscribers);
            for id in subscribers.drain(..) {
                self.inner.dispatcher.unregister(P::CHANNEL, id);
            }
            self.task.take()
        };
        if let Some(worker) = stopping {
            worker.join(STOP_GRACE).await;
        }
    }
}
