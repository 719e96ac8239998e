//! # Connection Status Model
//!
//! `ConnectionStatus` is an immutable value. Every change goes through one of
//! the named transitions below, each of which returns a new value, so the
//! `connected ⇒ NoError` and "attempts reset on connect" rules are enforced in
//! exactly one place.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::core::channel::{Channel, ChannelValue};
use crate::core::dispatcher::Dispatcher;
use std::sync::Arc;

/// Why a source is not (or no longer) connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NoError,
    ConnectionRefused,
    ConnectionLost,
    HandshakeError,
    Timeout,
    ProtocolError,
    StoreUnavailable,
}

/// # Connection Status
///
/// Point-in-time health of one logical connection (the Lighthouse link, the
/// main store or the health store).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error: ErrorKind,
    pub reconnect_attempts: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub uri: String,
    #[serde(serialize_with = "serialize_millis")]
    pub current_delay: Duration,
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Monotonic start of the latest connection attempt.
    #[serde(skip)]
    pub last_attempt: Option<Instant>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ConnectionStatus {
    /// A fresh, never-connected status for `uri`.
    pub fn new(uri: impl Into<String>, delay: Duration) -> Self {
        Self {
            connected: false,
            error: ErrorKind::NoError,
            reconnect_attempts: 0,
            last_connected: None,
            last_error: None,
            uri: uri.into(),
            current_delay: delay,
            messages_received: 0,
            bytes_received: 0,
            last_attempt: None,
        }
    }

    /// A connection attempt started at `at`.
    pub fn attempting(self, at: Instant) -> Self {
        Self {
            last_attempt: Some(at),
            ..self
        }
    }

    /// Handshake succeeded.
    pub fn connected_at(self, at: DateTime<Utc>, delay: Duration) -> Self {
        Self {
            connected: true,
            error: ErrorKind::NoError,
            reconnect_attempts: 0,
            last_connected: Some(at),
            current_delay: delay,
            ..self
        }
    }

    /// The connection failed or dropped with `error`. Attempts are untouched.
    pub fn failed_at(self, error: ErrorKind, at: DateTime<Utc>) -> Self {
        Self {
            connected: false,
            error,
            last_error: Some(at),
            ..self
        }
    }

    /// A retry has been scheduled after `delay`.
    pub fn retrying(self, error: ErrorKind, delay: Duration, at: DateTime<Utc>) -> Self {
        Self {
            connected: false,
            error,
            reconnect_attempts: self.reconnect_attempts.saturating_add(1),
            last_error: Some(at),
            current_delay: delay,
            ..self
        }
    }

    /// Transport closed. The last error kind is kept so the reason stays visible.
    pub fn disconnected(self) -> Self {
        Self {
            connected: false,
            ..self
        }
    }

    /// One more frame of `bytes` length arrived.
    pub fn received(self, bytes: usize) -> Self {
        Self {
            messages_received: self.messages_received.saturating_add(1),
            bytes_received: self.bytes_received.saturating_add(bytes as u64),
            ..self
        }
    }

    pub fn with_uri(self, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..self
        }
    }
}

/// # Status Cell
///
/// Shared holder of one source's status. The owning task writes through
/// [`StatusCell::update`]; anyone may read a snapshot. When a channel is
/// attached, every change is also published to the dispatcher.
pub struct StatusCell {
    current: RwLock<ConnectionStatus>,
    publish_to: Option<(Channel, Arc<Dispatcher>)>,
}

impl StatusCell {
    pub fn new(initial: ConnectionStatus) -> Self {
        Self {
            current: RwLock::new(initial),
            publish_to: None,
        }
    }

    /// Same as [`StatusCell::new`] but mirrors every change onto `channel`.
    pub fn published(initial: ConnectionStatus, channel: Channel, dispatcher: Arc<Dispatcher>) -> Self {
        dispatcher.publish(channel, ChannelValue::LinkStatus(initial.clone()));
        Self {
            current: RwLock::new(initial),
            publish_to: Some((channel, dispatcher)),
        }
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies a transition and returns the resulting status.
    pub fn update(&self, transition: impl FnOnce(ConnectionStatus) -> ConnectionStatus) -> ConnectionStatus {
        let next = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let next = transition(guard.clone());
            *guard = next.clone();
            next
        };

        if let Some((channel, dispatcher)) = &self.publish_to {
            dispatcher.publish(*channel, ChannelValue::LinkStatus(next.clone()));
        }
        next
    }
}
