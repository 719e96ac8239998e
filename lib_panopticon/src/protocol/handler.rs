//! # Frame Handler
//!
//! Turns raw binary frames into channel updates. One handler belongs to one
//! Lighthouse link and owns that link's CAN window.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use crate::core::channel::{Channel, ChannelValue};
use crate::core::dispatcher::Dispatcher;
use crate::core::status::StatusCell;
use crate::core::window::SlidingWindow;
use crate::error::DecodeError;
use crate::protocol::codec::StateCodec;
use crate::protocol::messages::{CanRecord, Frame, MessageType};

pub struct FrameHandler {
    can_window: Arc<SlidingWindow<CanRecord>>,
    codec: Arc<dyn StateCodec>,
    status: Arc<StatusCell>,
    dispatcher: Arc<Dispatcher>,
}

impl FrameHandler {
    pub fn new(
        max_can_frames: usize,
        codec: Arc<dyn StateCodec>,
        status: Arc<StatusCell>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            can_window: Arc::new(SlidingWindow::new(max_can_frames)),
            codec,
            status,
            dispatcher,
        }
    }

    /// Current CAN window.
    pub fn can_frames(&self) -> Arc<SlidingWindow<CanRecord>> {
        Arc::clone(&self.can_window)
    }

    /// Decodes one frame and publishes the result.
    ///
    /// Empty input is ignored. Once the type tag is valid the frame counts
    /// towards the link statistics even if its payload is then rejected.
    /// Decode errors are logged and the frame is dropped.
    pub fn handle_frame(&mut self, raw: Bytes) {
        if raw.is_empty() {
            return;
        }
        let frame = match Frame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame: {}", e);
                return;
            }
        };
        self.status.update(|s| s.received(raw.len()));

        if let Err(e) = self.dispatch(frame) {
            log::warn!("Dropping frame: {}", e);
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), DecodeError> {
        let received_at = Utc::now();
        let channel = match frame.kind {
            MessageType::CanFrame => {
                let record = CanRecord::decode(&frame.payload, received_at)?;
                log::trace!("CAN 0x{:X} dlc={}", record.id, record.dlc());
                // Copy-on-write: subscribers may still hold the previous window.
                Arc::make_mut(&mut self.can_window).push(record);
                self.dispatcher.publish(
                    Channel::CanFrames,
                    ChannelValue::CanFrames(Arc::clone(&self.can_window)),
                );
                return Ok(());
            }
            MessageType::StateUpdate => Channel::State,
            MessageType::StatusUpdate => Channel::SystemStatus,
            MessageType::TempUpdate => Channel::TempStatus,
        };

        let snapshot = self.codec.decode(frame.kind, frame.payload, received_at)?;
        self.dispatcher
            .publish(channel, ChannelValue::State(Arc::new(snapshot)));
        Ok(())
    }
}
