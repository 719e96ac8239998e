//! Tails the newest state-server log stream in the main store.
//!
//! Several app instances write `logs:app:<n>:state_server:<host>:info`
//! streams; only the lexicographically greatest key is followed, and only its
//! newest entry matters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::core::channel::{Channel, ChannelValue};
use crate::error::StoreError;
use crate::ingestors::poller::PollSource;
use crate::ingestors::store::KeyedStore;

pub const STATE_STREAM_PATTERN: &str = "logs:app:*state_server:*:info";

/// Newest entry of the followed stream, with the key it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyedStreamEntry {
    pub key: String,
    pub id: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StreamTailSource {
    pattern: String,
}

impl Default for StreamTailSource {
    fn default() -> Self {
        Self::new(STATE_STREAM_PATTERN)
    }
}

impl StreamTailSource {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into() }
    }
}

impl PollSource for StreamTailSource {
    type Output = KeyedStreamEntry;

    const NAME: &'static str = "StoreMonitor";
    const CHANNEL: Channel = Channel::RedisState;
    const PUBLISH_UNCHANGED: bool = false;

    async fn fetch<S: KeyedStore>(&self, store: &mut S) -> Result<Option<KeyedStreamEntry>, StoreError> {
        let keys = store.scan_keys(&self.pattern).await?;
        let Some(key) = keys.into_iter().max() else {
            log::debug!("No stream matches {}", self.pattern);
            return Ok(None);
        };
        let newest = store.tail(&key, 1).await?.into_iter().next();
        Ok(newest.map(|record| KeyedStreamEntry {
            key,
            id: record.id,
            data: record.fields,
        }))
    }

    fn to_value(output: &Arc<KeyedStreamEntry>) -> ChannelValue {
        ChannelValue::StreamEntry(Arc::clone(output))
    }
}
