//! # Lighthouse Protocol
//!
//! Binary framing of the Lighthouse device stream, the codec seam for the
//! fixed-layout state blobs and the handler that turns frames into channel
//! updates.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod codec;
pub mod handler;
pub mod messages;

// --- Public API Re-exports ---
pub use codec::{FixedLayoutCodec, StateCodec, StateSizes, StateSnapshot};
pub use handler::FrameHandler;
pub use messages::{CanFrameKind, CanRecord, Frame, MessageType};
