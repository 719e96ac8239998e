//! # Panopticon Live-Data Core
//!
//! Watches a Lighthouse device over WebSocket and two Redis instances, and
//! fans their updates out to subscribers at a fixed rate.
//!
//! - `protocol` decodes the device's binary frames.
//! - `ingestors` holds the reconnecting stream client and the poll monitors.
//! - `core` holds the dispatcher, status model, retry pacing and lifecycle slots.
//! - `context` ties them together behind `AppContext`.

// Declare the modules to re-export
pub mod configs;
pub mod context;
pub mod core;
pub mod error;
pub mod ingestors;
pub mod protocol;

// Re-export the everyday surface
pub use crate::configs::settings::{LighthouseSettings, PanopticonSettings, RedisSettings};
pub use crate::context::{AppContext, LogFeed};
pub use crate::core::{Channel, ChannelValue, ConnectionStatus, Dispatcher, ErrorKind, ManagedService, SubscriberId};
pub use crate::error::{DecodeError, LinkError, PanopticonError, StoreError, SubscriberError};
