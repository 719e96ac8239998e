//! # Data Ingestors Module
//!
//! Every external source the core watches. Each submodule owns the logic to
//! connect to, read from and recover from one kind of source; results leave
//! through the [`Dispatcher`](crate::core::dispatcher::Dispatcher).
//!
//! ## Contained Modules:
//! - **`lighthouse_wss`**: the reconnecting, receive-only WebSocket client for
//!   the Lighthouse device stream.
//! - **`store`**: the keyed-store seam (`KeyedStore`, `StoreConnector`) and
//!   its Redis implementation.
//! - **`poller`**: the generic self-scheduling poll monitor.
//! - **`health`**: the health-pool scanner plugged into the poller.
//! - **`stream_tail`**: the newest-stream-entry monitor plugged into the poller.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Health-pool key grammar and metrics.
pub mod health;
/// The Lighthouse WebSocket client.
pub mod lighthouse_wss;
/// Generic poll monitor.
pub mod poller;
/// Keyed store access.
pub mod store;
/// Newest-entry tail of the state-server streams.
pub mod stream_tail;

// --- Public API Re-exports ---
pub use health::{HealthBand, HealthKey, HealthMetric, HealthSource};
pub use lighthouse_wss::LighthouseClient;
pub use poller::{PollMonitor, PollOptions, PollSource};
pub use store::{KeyedStore, RedisConnector, RedisStore, StoreConnector, StreamRecord};
pub use stream_tail::{KeyedStreamEntry, StreamTailSource};

/// Health-pool monitor over Redis.
pub type HealthMonitor<C = RedisConnector> = PollMonitor<HealthSource, C>;
/// State-stream monitor over Redis.
pub type StoreMonitor<C = RedisConnector> = PollMonitor<StreamTailSource, C>;
