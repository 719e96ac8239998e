//! # Core Engine Module
//!
//! The pieces every source shares, independent of any transport:
//!
//! - **`status`**: the immutable `ConnectionStatus` value and the `StatusCell`
//!   each source writes it through.
//! - **`retry`**: reconnect pacing (minimum interval between attempts, optional
//!   capped backoff).
//! - **`window`**: the bounded sliding window behind event-complete channels.
//! - **`channel`**: the named feeds and the values they carry.
//! - **`dispatcher`**: latest-value-wins batching and isolated fan-out.
//! - **`registry`**: per-source lifecycle slots (idempotent initialize/stop).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Logical channels and their values.
pub mod channel;
/// The batching fan-out layer.
pub mod dispatcher;
/// Lifecycle slots for long-running sources.
pub mod registry;
/// Reconnect pacing.
pub mod retry;
/// Connection health values.
pub mod status;
/// Bounded event windows.
pub mod window;

// --- Public API Re-exports ---
pub use channel::{Channel, ChannelValue, UnknownChannel};
pub use dispatcher::{Callback, Dispatcher, FlushStats, SubscriberId};
pub use registry::{BackgroundTask, ManagedService, ServiceSlot, StoppingWorker};
pub use retry::{RetryPacer, RetryPolicy};
pub use status::{ConnectionStatus, ErrorKind, StatusCell};
pub use window::SlidingWindow;
