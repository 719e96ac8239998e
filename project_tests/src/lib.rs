//! Shared harness for the integration tests: an in-memory keyed store and a
//! scripted Lighthouse device speaking WebSocket on localhost.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use lib_panopticon::error::StoreError;
use glob::Pattern;
use lib_panopticon::ingestors::store::{KeyedStore, StoreConnector, StreamRecord};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// --- In-memory store ---

#[derive(Default)]
struct MemoryData {
    strings: BTreeMap<String, String>,
    streams: BTreeMap<String, Vec<StreamRecord>>,
}

/// Connector over a shared in-memory map. Flip `set_available(false)` to
/// make both new connections and open ones fail.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    data: Arc<Mutex<MemoryData>>,
    unavailable: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.data.lock().unwrap().strings.insert(key.to_string(), value.to_string());
    }

    /// Appends an entry to the stream at `key`.
    pub fn append(&self, key: &str, id: &str, fields: &[(&str, &str)]) {
        let record = StreamRecord {
            id: id.to_string(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        self.data
            .lock()
            .unwrap()
            .streams
            .entry(key.to_string())
            .or_default()
            .push(record);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    fn uri(&self) -> String {
        "memory://test".to_string()
    }

    async fn connect(&self) -> Result<MemoryStore, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(self.uri()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryStore {
            data: Arc::clone(&self.data),
            unavailable: Arc::clone(&self.unavailable),
        })
    }
}

pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory://test".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Compiles a Redis `MATCH` pattern into a [`Pattern`].
///
/// Redis writes a negated class as `[^...]` and escapes with `\`; `glob`
/// spells those `[!...]` and `[c]`.
pub fn redis_pattern(pattern: &str) -> Result<Pattern, glob::PatternError> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) if in_class => translated.push(escaped),
                Some(escaped) => {
                    translated.push('[');
                    translated.push(escaped);
                    translated.push(']');
                }
                None => translated.push_str("[\\]"),
            },
            '[' if !in_class => {
                in_class = true;
                translated.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    translated.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                translated.push(']');
            }
            other => translated.push(other),
        }
    }
    Pattern::new(&translated)
}

impl KeyedStore for MemoryStore {
    async fn scan_keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let matcher = redis_pattern(pattern).map_err(|e| StoreError::Reply(format!("bad pattern {}: {}", pattern, e)))?;
        let data = self.data.lock().unwrap();
        Ok(data
            .strings
            .keys()
            .chain(data.streams.keys())
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.data.lock().unwrap().strings.get(key).cloned())
    }

    async fn tail(&mut self, key: &str, count: usize) -> Result<Vec<StreamRecord>, StoreError> {
        self.check()?;
        let data = self.data.lock().unwrap();
        Ok(data
            .streams
            .get(key)
            .map(|entries| entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

// --- Scripted Lighthouse device ---

/// What the device does after sending its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterScript {
    /// Sends a close frame.
    Close,
    /// Keeps the connection open until the client goes away.
    Hold,
}

/// A local WebSocket server that sends the same binary frames to every client.
pub struct DeviceServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl DeviceServer {
    pub async fn start(script: Vec<Vec<u8>>, after: AfterScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    for frame in script {
                        if ws.send(Message::Binary(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    match after {
                        AfterScript::Close => {
                            let _ = ws.close(None).await;
                        }
                        AfterScript::Hold => {
                            use futures_util::StreamExt;
                            while let Some(Ok(_)) = ws.next().await {}
                        }
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            handle,
        }
    }

    pub fn uri(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for DeviceServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A port with nothing listening on it.
pub async fn closed_port_uri() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// Polls `check` every 20 ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
