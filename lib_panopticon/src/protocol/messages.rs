//! Lighthouse wire messages.
//!
//! Every frame is `[type:1][payload..]`. The CAN payload layout is
//! `[kind:1][id:4 LE][dlc:1][data:dlc]`; the three state payloads are opaque
//! here and go to a [`StateCodec`](super::codec::StateCodec).

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::DecodeError;

/// Maximum data bytes of a classic CAN frame.
pub const CAN_MAX_DLC: u8 = 8;
/// `kind` + `id` + `dlc`.
pub const CAN_HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CanFrame = 0,
    StateUpdate = 1,
    StatusUpdate = 2,
    TempUpdate = 3,
}

impl MessageType {
    pub fn from_byte(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(MessageType::CanFrame),
            1 => Ok(MessageType::StateUpdate),
            2 => Ok(MessageType::StatusUpdate),
            3 => Ok(MessageType::TempUpdate),
            other => Err(DecodeError::InvalidFrameType(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::CanFrame => "CAN_FRAME",
            MessageType::StateUpdate => "STATE_UPDATE",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::TempUpdate => "TEMP_UPDATE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame split into its tag and (still undecoded) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Reads the tag byte. The payload is a cheap slice of `raw`.
    pub fn parse(raw: &Bytes) -> Result<Self, DecodeError> {
        let tag = *raw.first().ok_or(DecodeError::Empty)?;
        Ok(Self {
            kind: MessageType::from_byte(tag)?,
            payload: raw.slice(1..),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanFrameKind {
    Classic,
    Fd,
}

impl CanFrameKind {
    pub fn from_byte(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(CanFrameKind::Classic),
            1 => Ok(CanFrameKind::Fd),
            other => Err(DecodeError::InvalidCanKind(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            CanFrameKind::Classic => 0,
            CanFrameKind::Fd => 1,
        }
    }
}

/// One CAN bus frame as relayed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanRecord {
    pub kind: CanFrameKind,
    pub id: u32,
    dlc: u8,
    data: [u8; CAN_MAX_DLC as usize],
    pub received_at: DateTime<Utc>,
}

impl CanRecord {
    /// Builds a record from at most eight data bytes.
    pub fn new(kind: CanFrameKind, id: u32, data: &[u8], received_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        let dlc = u8::try_from(data.len()).unwrap_or(u8::MAX);
        if dlc > CAN_MAX_DLC {
            return Err(DecodeError::DlcOutOfRange(dlc));
        }
        let mut buf = [0u8; CAN_MAX_DLC as usize];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            kind,
            id,
            dlc,
            data: buf,
            received_at,
        })
    }

    /// Decodes a CAN payload (the bytes after the frame tag).
    ///
    /// A dlc above 8 or a payload shorter than `6 + dlc` is rejected. Bytes past
    /// the data region are ignored.
    pub fn decode(payload: &[u8], received_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        if payload.len() < CAN_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: CAN_HEADER_LEN,
                actual: payload.len(),
            });
        }
        let kind = CanFrameKind::from_byte(payload[0])?;
        let id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let dlc = payload[5];
        if dlc > CAN_MAX_DLC {
            return Err(DecodeError::DlcOutOfRange(dlc));
        }
        let end = CAN_HEADER_LEN + dlc as usize;
        let data = payload.get(CAN_HEADER_LEN..end).ok_or(DecodeError::Truncated {
            needed: end,
            actual: payload.len(),
        })?;
        Self::new(kind, id, data, received_at)
    }

    /// The CAN payload layout of this record, without the frame tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CAN_HEADER_LEN + self.dlc as usize);
        out.push(self.kind.as_byte());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.dlc);
        out.extend_from_slice(self.data());
        out
    }

    /// A complete wire frame, tag included.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut out = vec![MessageType::CanFrame as u8];
        out.extend(self.encode());
        out
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

impl Serialize for CanRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("CanRecord", 5)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("id", &format!("0x{:03X}", self.id))?;
        s.serialize_field("dlc", &self.dlc)?;
        s.serialize_field("data", &hex::encode_upper(self.data()))?;
        s.serialize_field("receivedAt", &self.received_at)?;
        s.end()
    }
}
