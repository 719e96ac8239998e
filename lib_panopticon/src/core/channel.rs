//! # Channels
//!
//! The fixed set of logical feeds and the values they carry. A channel value
//! is handed to subscribers by shared reference; anything non-trivial sits
//! behind an `Arc` so a flush never deep-copies.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::core::status::ConnectionStatus;
use crate::core::window::SlidingWindow;
use crate::ingestors::health::HealthMetric;
use crate::ingestors::stream_tail::KeyedStreamEntry;
use crate::protocol::codec::StateSnapshot;
use crate::protocol::messages::CanRecord;

/// A named logical update feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    CanFrames,
    State,
    SystemStatus,
    TempStatus,
    WebsocketStatus,
    HealthMetrics,
    RedisState,
    Logs,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::CanFrames,
        Channel::State,
        Channel::SystemStatus,
        Channel::TempStatus,
        Channel::WebsocketStatus,
        Channel::HealthMetrics,
        Channel::RedisState,
        Channel::Logs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::CanFrames => "can_frames",
            Channel::State => "state",
            Channel::SystemStatus => "system_status",
            Channel::TempStatus => "temp_status",
            Channel::WebsocketStatus => "websocket_status",
            Channel::HealthMetrics => "health_metrics",
            Channel::RedisState => "redis_state",
            Channel::Logs => "logs",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a channel name is not one of [`Channel::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChannel(pub String);

impl fmt::Display for UnknownChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown update type '{}'", self.0)
    }
}

impl std::error::Error for UnknownChannel {}

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

/// The latest value of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelValue {
    CanFrames(Arc<SlidingWindow<CanRecord>>),
    /// Decoded state blob; used by `state`, `system_status` and `temp_status`.
    State(Arc<StateSnapshot>),
    LinkStatus(ConnectionStatus),
    HealthMetrics(Arc<BTreeMap<String, HealthMetric>>),
    StreamEntry(Arc<KeyedStreamEntry>),
    Logs(Arc<SlidingWindow<String>>),
}
