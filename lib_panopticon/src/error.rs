//! # Error Types
//!
//! Every failure the core can observe has a typed home here. Only
//! [`PanopticonError`] is ever returned to API callers; the other enums are
//! produced and consumed inside the background loops, where they are folded
//! into a [`ConnectionStatus`](crate::core::status::ConnectionStatus) update
//! and a scheduled retry.

use thiserror::Error;

/// Errors surfaced to callers of the public API.
#[derive(Debug, Error)]
pub enum PanopticonError {
    /// A source was used before `initialize()` (or after `stop()`).
    #[error("{0} must be initialized before use")]
    NotInitialized(&'static str),

    /// Settings could not be turned into a usable connection target.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The keyed store rejected or dropped a request.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Reasons a raw frame is dropped by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Invalid message type value: {0}")]
    InvalidFrameType(u8),

    #[error("Invalid CAN frame kind: {0}")]
    InvalidCanKind(u8),

    #[error("CAN dlc {0} exceeds 8 data bytes")]
    DlcOutOfRange(u8),

    #[error("Truncated payload: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Payload size mismatch for {kind}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Codec failure: {0}")]
    Codec(String),
}

/// Failures of the Lighthouse WebSocket link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Handshake with {uri} failed: {reason}")]
    Handshake { uri: String, reason: String },

    #[error("Handshake with {0} timed out")]
    Timeout(String),
}

/// Failures of a keyed store (Redis or an in-memory stand-in).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store at {0} is unavailable")]
    Unavailable(String),

    #[error("Connecting to {0} timed out")]
    Timeout(String),

    #[error("Connecting to {0} was cancelled")]
    Cancelled(String),

    #[error("Gave up connecting to {uri} after {attempts} attempts")]
    RetriesExhausted { uri: String, attempts: u32 },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected reply: {0}")]
    Reply(String),
}

/// A subscriber callback reported a failure.
#[derive(Debug, Clone, Error)]
#[error("Subscriber callback failed: {0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    /// Wraps any displayable failure reason.
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}
