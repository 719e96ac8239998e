//! # Application Context
//!
//! `AppContext` is the single owner of everything long-lived: the dispatcher
//! and its flush task, one [`ServiceSlot`] per source and the log feed. It is
//! created once and shared by `Arc`.
//!
//! ## Channel routing
//! - `health_metrics` and `redis_state` belong to the two monitors. Registering
//!   on them creates the monitor if needed and subscribes through it, which
//!   starts its poll loop.
//! - The Lighthouse channels (`can_frames`, `state`, `system_status`,
//!   `temp_status`, `websocket_status`) need an initialized link; otherwise
//!   `register` fails with `NotInitialized`.
//! - `logs` is always available.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::configs::settings::PanopticonSettings;
use crate::core::channel::{Channel, ChannelValue};
use crate::core::dispatcher::{Dispatcher, SubscriberId};
use crate::core::registry::{BackgroundTask, ServiceSlot};
use crate::core::window::SlidingWindow;
use crate::error::{PanopticonError, SubscriberError};
use crate::ingestors::lighthouse_wss::LighthouseClient;
use crate::ingestors::poller::{PollMonitor, PollOptions};
use crate::ingestors::store::{RedisConnector, StoreConnector};
use crate::ingestors::{HealthMonitor, HealthSource, StoreMonitor, StreamTailSource};
use crate::protocol::codec::{FixedLayoutCodec, StateCodec};

const FLUSH_STOP_GRACE: Duration = Duration::from_secs(2);

/// Recent log lines, published on the `logs` channel.
pub struct LogFeed {
    window: Mutex<Arc<SlidingWindow<String>>>,
    dispatcher: Arc<Dispatcher>,
}

impl LogFeed {
    pub fn new(capacity: usize, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            window: Mutex::new(Arc::new(SlidingWindow::new(capacity))),
            dispatcher,
        }
    }

    fn window(&self) -> MutexGuard<'_, Arc<SlidingWindow<String>>> {
        match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends one line. Must not log: it runs inside the logger.
    pub fn push(&self, line: impl Into<String>) {
        let mut window = self.window();
        Arc::make_mut(&mut window).push(line.into());
        self.dispatcher
            .publish(Channel::Logs, ChannelValue::Logs(Arc::clone(&window)));
    }

    pub fn snapshot(&self) -> Arc<SlidingWindow<String>> {
        Arc::clone(&self.window())
    }
}

pub struct AppContext<C: StoreConnector + Clone = RedisConnector> {
    settings: PanopticonSettings,
    dispatcher: Arc<Dispatcher>,
    flush_task: BackgroundTask,
    codec: Arc<dyn StateCodec>,
    log_feed: Arc<LogFeed>,
    main_connector: C,
    health_connector: C,
    lighthouse: ServiceSlot<LighthouseClient>,
    health: ServiceSlot<HealthMonitor<C>>,
    store: ServiceSlot<StoreMonitor<C>>,
}

impl AppContext<RedisConnector> {
    /// Context over the two Redis instances named in `settings`.
    pub fn new(settings: PanopticonSettings) -> Result<Self, PanopticonError> {
        let main = RedisConnector::new(&settings.redis_main)?;
        let health = RedisConnector::new(&settings.redis_health)?;
        let codec = Arc::new(FixedLayoutCodec::new(settings.lighthouse.state_sizes));
        Ok(Self::with_connectors(settings, codec, main, health))
    }
}

impl<C: StoreConnector + Clone> AppContext<C> {
    pub fn with_connectors(settings: PanopticonSettings, codec: Arc<dyn StateCodec>, main: C, health: C) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(settings.batch_interval()));
        let log_feed = Arc::new(LogFeed::new(settings.log_window, Arc::clone(&dispatcher)));
        Self {
            settings,
            dispatcher,
            flush_task: BackgroundTask::new(),
            codec,
            log_feed,
            main_connector: main,
            health_connector: health,
            lighthouse: ServiceSlot::new("LighthouseClient"),
            health: ServiceSlot::new("HealthMonitor"),
            store: ServiceSlot::new("StoreMonitor"),
        }
    }

    pub fn settings(&self) -> &PanopticonSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn log_feed(&self) -> Arc<LogFeed> {
        Arc::clone(&self.log_feed)
    }

    /// Starts the flush timer. Calling it again is a no-op.
    pub fn start(&self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.flush_task.spawn(move |token| dispatcher.run(token));
    }

    // --- Source lifecycle ---

    /// Get-or-create the Lighthouse client. It is not started.
    pub async fn initialize_lighthouse(&self) -> Arc<LighthouseClient> {
        self.lighthouse
            .initialize(|| {
                LighthouseClient::new(
                    self.settings.lighthouse.clone(),
                    Arc::clone(&self.codec),
                    Arc::clone(&self.dispatcher),
                )
            })
            .await
    }

    pub async fn initialize_health_monitor(&self) -> Arc<HealthMonitor<C>> {
        self.health
            .initialize(|| {
                PollMonitor::new(
                    HealthSource,
                    self.health_connector.clone(),
                    PollOptions::from_settings(&self.settings.redis_health),
                    Arc::clone(&self.dispatcher),
                )
            })
            .await
    }

    pub async fn initialize_store_monitor(&self) -> Arc<StoreMonitor<C>> {
        self.store
            .initialize(|| {
                PollMonitor::new(
                    StreamTailSource::default(),
                    self.main_connector.clone(),
                    PollOptions::from_settings(&self.settings.redis_main),
                    Arc::clone(&self.dispatcher),
                )
            })
            .await
    }

    pub async fn lighthouse(&self) -> Result<Arc<LighthouseClient>, PanopticonError> {
        self.lighthouse.get().await
    }

    pub async fn health_monitor(&self) -> Result<Arc<HealthMonitor<C>>, PanopticonError> {
        self.health.get().await
    }

    pub async fn store_monitor(&self) -> Result<Arc<StoreMonitor<C>>, PanopticonError> {
        self.store.get().await
    }

    pub async fn stop_lighthouse(&self) -> bool {
        self.lighthouse.stop().await
    }

    pub async fn stop_health_monitor(&self) -> bool {
        self.health.stop().await
    }

    pub async fn stop_store_monitor(&self) -> bool {
        self.store.stop().await
    }

    // --- Subscriptions ---

    /// # Register
    ///
    /// Subscribes `callback` to `channel`. See the module docs for how each
    /// channel is routed.
    pub async fn register<F>(&self, channel: Channel, callback: F) -> Result<SubscriberId, PanopticonError>
    where
        F: Fn(&ChannelValue) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.start();
        let id = match channel {
            Channel::HealthMetrics => self.initialize_health_monitor().await.subscribe(callback),
            Channel::RedisState => self.initialize_store_monitor().await.subscribe(callback),
            Channel::Logs => self.dispatcher.register(channel, callback),
            Channel::CanFrames
            | Channel::State
            | Channel::SystemStatus
            | Channel::TempStatus
            | Channel::WebsocketStatus => {
                self.lighthouse.get().await?;
                self.dispatcher.register(channel, callback)
            }
        };
        Ok(id)
    }

    /// Like [`register`](Self::register) with a channel name. An unknown name
    /// is logged and yields `Ok(None)`.
    pub async fn register_by_name<F>(&self, name: &str, callback: F) -> Result<Option<SubscriberId>, PanopticonError>
    where
        F: Fn(&ChannelValue) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        match name.parse::<Channel>() {
            Ok(channel) => self.register(channel, callback).await.map(Some),
            Err(e) => {
                log::warn!("{}", e);
                Ok(None)
            }
        }
    }

    /// Removes a subscription. Leaving a monitor channel as its last
    /// subscriber stops that monitor's poll loop.
    pub async fn unregister(&self, channel: Channel, id: SubscriberId) -> bool {
        match channel {
            Channel::HealthMetrics => match self.health.get().await {
                Ok(monitor) => monitor.unsubscribe(id).await,
                Err(_) => false,
            },
            Channel::RedisState => match self.store.get().await {
                Ok(monitor) => monitor.unsubscribe(id).await,
                Err(_) => false,
            },
            _ => self.dispatcher.unregister(channel, id),
        }
    }

    /// Stops every source, then the flush timer.
    pub async fn stop_all(&self) {
        log::info!("Stopping all sources");
        let (lighthouse, health, store) = tokio::join!(
            self.lighthouse.stop(),
            self.health.stop(),
            self.store.stop()
        );
        log::debug!(
            "Stopped: lighthouse={} health={} store={}",
            lighthouse,
            health,
            store
        );
        self.flush_task.stop(FLUSH_STOP_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ManagedService;

    fn context() -> AppContext {
        AppContext::new(PanopticonSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_lighthouse_channels_need_initialized_link() {
        let ctx = context();
        let err = ctx.register(Channel::CanFrames, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, PanopticonError::NotInitialized("LighthouseClient")));

        ctx.initialize_lighthouse().await;
        assert!(ctx.register(Channel::CanFrames, |_| Ok(())).await.is_ok());
        ctx.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_channel_name_returns_none() {
        let ctx = context();
        assert_eq!(ctx.register_by_name("video", |_| Ok(())).await.unwrap(), None);
        assert!(ctx.register_by_name("logs", |_| Ok(())).await.unwrap().is_some());
        ctx.stop_all().await;
    }

    #[tokio::test]
    async fn test_link_status_is_published_on_initialize() {
        let ctx = context();
        let client = ctx.initialize_lighthouse().await;
        assert!(!client.is_running());
        match ctx.dispatcher().pending(Channel::WebsocketStatus) {
            Some(ChannelValue::LinkStatus(status)) => {
                assert_eq!(status.uri, "ws://localhost:8089");
                assert!(!status.connected);
            }
            other => panic!("unexpected pending value: {:?}", other),
        }
        client.shutdown().await;
    }

    #[test]
    fn test_log_feed_keeps_window() {
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
        let feed = LogFeed::new(2, Arc::clone(&dispatcher));
        feed.push("a");
        feed.push("b");
        feed.push("c");

        let lines: Vec<String> = feed.snapshot().iter().cloned().collect();
        assert_eq!(lines, vec!["b".to_string(), "c".to_string()]);
        assert!(matches!(dispatcher.pending(Channel::Logs), Some(ChannelValue::Logs(w)) if w.len() == 2));
    }
}
