//! Hand-off point for the fixed-layout state blobs.
//!
//! The field layout of `STATE_UPDATE`, `STATUS_UPDATE` and `TEMP_UPDATE`
//! payloads is generated elsewhere; the core only needs a [`StateCodec`] that
//! either returns a [`StateSnapshot`] or refuses the bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::DecodeError;
use crate::protocol::messages::MessageType;

/// A decoded state blob.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: MessageType,
    #[serde(serialize_with = "serialize_hex")]
    pub raw: Bytes,
    /// Structured form produced by the codec, `None` when it only validates.
    pub decoded: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

fn serialize_kind<S: Serializer>(kind: &MessageType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.name())
}

fn serialize_hex<S: Serializer>(raw: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(raw))
}

pub trait StateCodec: Send + Sync + 'static {
    fn decode(&self, kind: MessageType, payload: Bytes, received_at: DateTime<Utc>) -> Result<StateSnapshot, DecodeError>;
}

/// Expected payload sizes per state message. `None` accepts any length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateSizes {
    pub state: Option<usize>,
    pub system_status: Option<usize>,
    pub temp_status: Option<usize>,
}

impl StateSizes {
    pub fn expected(&self, kind: MessageType) -> Option<usize> {
        match kind {
            MessageType::StateUpdate => self.state,
            MessageType::StatusUpdate => self.system_status,
            MessageType::TempUpdate => self.temp_status,
            MessageType::CanFrame => None,
        }
    }
}

/// Size-checking codec that keeps the payload opaque.
#[derive(Debug, Clone, Default)]
pub struct FixedLayoutCodec {
    sizes: StateSizes,
}

impl FixedLayoutCodec {
    pub fn new(sizes: StateSizes) -> Self {
        Self { sizes }
    }
}

impl StateCodec for FixedLayoutCodec {
    fn decode(&self, kind: MessageType, payload: Bytes, received_at: DateTime<Utc>) -> Result<StateSnapshot, DecodeError> {
        if kind == MessageType::CanFrame {
            return Err(DecodeError::Codec("CAN frames are not state blobs".to_string()));
        }
        if let Some(expected) = self.sizes.expected(kind) {
            if payload.len() != expected {
                return Err(DecodeError::SizeMismatch {
                    kind: kind.name(),
                    expected,
                    actual: payload.len(),
                });
            }
        }
        Ok(StateSnapshot {
            kind,
            raw: payload,
            decoded: None,
            received_at,
        })
    }
}
