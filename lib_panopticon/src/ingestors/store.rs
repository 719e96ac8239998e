//! # Keyed Store Access
//!
//! The monitors only need three read operations from a key/value store:
//! glob scan, plain GET and the newest entries of an append log. They are
//! expressed by [`KeyedStore`] so the poll loop can run against Redis in
//! production and an in-memory map in tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use url::Url;

use crate::configs::settings::RedisSettings;
use crate::error::{PanopticonError, StoreError};

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// One entry of an append log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

pub trait KeyedStore: Send + 'static {
    /// Every key matching the glob `pattern`.
    fn scan_keys(&mut self, pattern: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn get(&mut self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Up to `count` entries of the log at `key`, newest first.
    fn tail(&mut self, key: &str, count: usize) -> impl Future<Output = Result<Vec<StreamRecord>, StoreError>> + Send;
}

/// Opens connections to one store.
pub trait StoreConnector: Send + Sync + 'static {
    type Store: KeyedStore;

    /// Printable target, without credentials.
    fn uri(&self) -> String;

    fn connect(&self) -> impl Future<Output = Result<Self::Store, StoreError>> + Send;
}

/// # Redis Connector
///
/// Builds a multiplexed async connection per [`connect`](StoreConnector::connect)
/// call and checks it with `PING` before handing it out.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: Url,
    display_uri: String,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(settings: &RedisSettings) -> Result<Self, PanopticonError> {
        Ok(Self {
            url: settings.connection_url()?,
            display_uri: settings.display_uri(),
            connect_timeout: settings.connect_timeout(),
        })
    }
}

impl StoreConnector for RedisConnector {
    type Store = RedisStore;

    fn uri(&self) -> String {
        self.display_uri.clone()
    }

    async fn connect(&self) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = tokio::time::timeout(self.connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(self.display_uri.clone()))??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        log::debug!("Connected to {} ({})", self.display_uri, pong);
        Ok(RedisStore { conn })
    }
}

/// A live Redis connection.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl KeyedStore for RedisStore {
    async fn scan_keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut self.conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut self.conn).await?;
        Ok(value)
    }

    async fn tail(&mut self, key: &str, count: usize) -> Result<Vec<StreamRecord>, StoreError> {
        let entries: Vec<(String, BTreeMap<String, String>)> = redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(id, fields)| StreamRecord { id, fields })
            .collect())
    }
}
