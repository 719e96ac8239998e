//! # Latest-Value Batching Dispatcher
//!
//! The `Dispatcher` sits between every producer (the Lighthouse link, the
//! Redis pollers, the log hook) and every consumer callback.
//!
//! ## Core Design Principles:
//!
//! 1.  **Latest Value Wins**: `publish` never queues. Each channel holds at most
//!     one pending value and a newer value simply overwrites it, so a burst of N
//!     updates between two ticks costs one notification carrying the N-th
//!     value. Sources where history matters publish a bounded window as their
//!     value instead of single events.
//!
//! 2.  **Fixed-Rate Flush**: `run` ticks every `batch_interval` and hands each
//!     pending value to the channel's subscribers in registration order, then
//!     forgets it.
//!
//! 3.  **Callback Isolation**: every callback runs inside its own error and
//!     panic capture. A failing subscriber is logged and skipped; the others on
//!     the same channel, and every other channel, are still notified.
//!
//! 4.  **Short Critical Sections**: the pending map and the subscriber lists are
//!     locked only to swap or copy them. No lock is held while a callback runs,
//!     so callbacks may publish, register or unregister freely.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::channel::{Channel, ChannelValue};
use crate::error::SubscriberError;

/// A subscriber callback. It receives the channel's latest value by reference
/// and must not hold on to anything it does not clone.
pub type Callback = Arc<dyn Fn(&ChannelValue) -> Result<(), SubscriberError> + Send + Sync>;

/// Handle returned by [`Dispatcher::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    callback: Callback,
}

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Channels that had a pending value.
    pub channels: usize,
    /// Callbacks that returned `Ok`.
    pub delivered: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
}

/// # Core Dispatcher
pub struct Dispatcher {
    batch_interval: Duration,
    pending: Mutex<BTreeMap<Channel, ChannelValue>>,
    subscribers: Mutex<HashMap<Channel, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Dispatcher {
    pub fn new(batch_interval: Duration) -> Self {
        Self {
            batch_interval,
            pending: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn batch_interval(&self) -> Duration {
        self.batch_interval
    }

    /// # Publish
    ///
    /// Stores `value` as the pending value of `channel`, replacing any value
    /// that has not been flushed yet.
    pub fn publish(&self, channel: Channel, value: ChannelValue) {
        lock(&self.pending).insert(channel, value);
    }

    /// The value that the next flush would deliver on `channel`, if any.
    pub fn pending(&self, channel: Channel) -> Option<ChannelValue> {
        lock(&self.pending).get(&channel).cloned()
    }

    /// # Register
    ///
    /// Appends a callback to `channel`'s subscriber list. Delivery order within
    /// a channel follows registration order.
    pub fn register<F>(&self, channel: Channel, callback: F) -> SubscriberId
    where
        F: Fn(&ChannelValue) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.register_callback(channel, Arc::new(callback))
    }

    pub fn register_callback(&self, channel: Channel, callback: Callback) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers)
            .entry(channel)
            .or_default()
            .push(Subscriber { id, callback });
        log::debug!("Subscriber {:?} registered on '{}'", id, channel);
        id
    }

    /// Removes a subscriber. Returns `false` if it was not registered on `channel`.
    pub fn unregister(&self, channel: Channel, id: SubscriberId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let Some(list) = subscribers.get_mut(&channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&channel);
        }
        if removed {
            log::debug!("Subscriber {:?} unregistered from '{}'", id, channel);
        }
        removed
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        lock(&self.subscribers).get(&channel).map_or(0, Vec::len)
    }

    /// # Flush
    ///
    /// Delivers every pending value to its subscribers and clears the pending
    /// map. Values published while the flush is running are kept for the next
    /// cycle.
    pub fn flush(&self) -> FlushStats {
        let batch = std::mem::take(&mut *lock(&self.pending));
        let mut stats = FlushStats {
            channels: batch.len(),
            ..FlushStats::default()
        };

        for (channel, value) in batch {
            let callbacks: Vec<(SubscriberId, Callback)> = lock(&self.subscribers)
                .get(&channel)
                .map(|list| list.iter().map(|s| (s.id, Arc::clone(&s.callback))).collect())
                .unwrap_or_default();

            for (id, callback) in callbacks {
                match catch_unwind(AssertUnwindSafe(|| callback(&value))) {
                    Ok(Ok(())) => stats.delivered += 1,
                    Ok(Err(e)) => {
                        stats.failed += 1;
                        log::error!("Error in callback {:?} for '{}': {}", id, channel, e);
                    }
                    Err(_) => {
                        stats.failed += 1;
                        log::error!("Callback {:?} for '{}' panicked", id, channel);
                    }
                }
            }
        }
        stats
    }

    /// Flush loop. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        log::info!("Dispatcher flushing every {:?}", self.batch_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.flush();
                    if stats.failed > 0 {
                        log::warn!("Flush finished with {} failed callback(s)", stats.failed);
                    }
                }
            }
        }
        log::info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::ConnectionStatus;

    fn status_value(bytes: usize) -> ChannelValue {
        ChannelValue::LinkStatus(ConnectionStatus::new("ws://test", Duration::ZERO).received(bytes))
    }

    fn bytes_of(value: &ChannelValue) -> u64 {
        match value {
            ChannelValue::LinkStatus(s) => s.bytes_received,
            _ => u64::MAX,
        }
    }

    #[test]
    fn test_burst_collapses_to_latest_value() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register(Channel::WebsocketStatus, move |v| {
            sink.lock().unwrap().push(bytes_of(v));
            Ok(())
        });

        dispatcher.publish(Channel::WebsocketStatus, status_value(1));
        dispatcher.publish(Channel::WebsocketStatus, status_value(2));
        let stats = dispatcher.flush();

        assert_eq!(stats.delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec![2]);

        // Nothing pending, nothing delivered.
        assert_eq!(dispatcher.flush(), FlushStats::default());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_subscribers_do_not_block_others() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        dispatcher.register(Channel::WebsocketStatus, move |_| {
            first.lock().unwrap().push("first");
            Err(SubscriberError::new("boom"))
        });
        dispatcher.register(Channel::WebsocketStatus, |_| panic!("subscriber panic"));
        let third = Arc::clone(&order);
        dispatcher.register(Channel::WebsocketStatus, move |_| {
            third.lock().unwrap().push("third");
            Ok(())
        });

        dispatcher.publish(Channel::WebsocketStatus, status_value(7));
        let stats = dispatcher.flush();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
        assert!(dispatcher.pending(Channel::WebsocketStatus).is_none());
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = dispatcher.register(Channel::Logs, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(dispatcher.subscriber_count(Channel::Logs), 1);

        assert!(dispatcher.unregister(Channel::Logs, id));
        assert!(!dispatcher.unregister(Channel::Logs, id));
        assert_eq!(dispatcher.subscriber_count(Channel::Logs), 0);

        dispatcher.publish(Channel::Logs, ChannelValue::Logs(Arc::new(
            crate::core::window::SlidingWindow::new(4),
        )));
        dispatcher.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_publish_during_flush() {
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
        let inner = Arc::clone(&dispatcher);
        dispatcher.register(Channel::WebsocketStatus, move |_| {
            inner.publish(Channel::WebsocketStatus, status_value(99));
            Ok(())
        });

        dispatcher.publish(Channel::WebsocketStatus, status_value(1));
        dispatcher.flush();
        let next = dispatcher.pending(Channel::WebsocketStatus).map(|v| bytes_of(&v));
        assert_eq!(next, Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_timer() {
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register(Channel::WebsocketStatus, move |v| {
            sink.lock().unwrap().push(bytes_of(v));
            Ok(())
        });

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dispatcher).run(token.clone()));
        tokio::task::yield_now().await;

        dispatcher.publish(Channel::WebsocketStatus, status_value(1));
        dispatcher.publish(Channel::WebsocketStatus, status_value(2));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2]);

        dispatcher.publish(Channel::WebsocketStatus, status_value(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);

        token.cancel();
        task.await.unwrap();
    }
}
