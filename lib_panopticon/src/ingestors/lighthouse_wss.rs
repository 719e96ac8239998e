//! # Lighthouse WebSocket Ingestor
//!
//! Receive-only client for the Lighthouse device stream. A single supervisor
//! task repeats `connect → read → disconnect` until shutdown:
//!
//! - **connect** waits until the minimum interval since the previous attempt
//!   has passed, then performs the handshake under a timeout.
//! - **read** waits for the next frame with a short timeout so shutdown is
//!   noticed quickly; every binary frame goes through the [`FrameHandler`].
//! - **disconnect** always closes the transport, on the failure and the
//!   success path alike.
//!
//! Nothing here is fatal. Every failure is folded into the link's
//! [`ConnectionStatus`], which is also published on `websocket_status`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::settings::LighthouseSettings;
use crate::core::channel::Channel;
use crate::core::dispatcher::Dispatcher;
use crate::core::registry::{BackgroundTask, ManagedService};
use crate::core::retry::{sleep_or_shutdown, RetryPacer};
use crate::core::status::{ConnectionStatus, ErrorKind, StatusCell};
use crate::error::LinkError;
use crate::protocol::codec::StateCodec;
use crate::protocol::handler::FrameHandler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STOP_GRACE: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

impl LinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Refused(_) => ErrorKind::ConnectionRefused,
            LinkError::Handshake { .. } => ErrorKind::HandshakeError,
            LinkError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    Shutdown,
    Lost(ErrorKind),
}

struct LinkInner {
    settings: LighthouseSettings,
    codec: Arc<dyn StateCodec>,
    status: Arc<StatusCell>,
    dispatcher: Arc<Dispatcher>,
}

pub struct LighthouseClient {
    inner: Arc<LinkInner>,
    task: BackgroundTask,
}

impl LighthouseClient {
    /// Creates a stopped client. Its status is published right away.
    pub fn new(settings: LighthouseSettings, codec: Arc<dyn StateCodec>, dispatcher: Arc<Dispatcher>) -> Self {
        let initial = ConnectionStatus::new(settings.uri.clone(), settings.retry_policy().min_interval);
        let status = Arc::new(StatusCell::published(
            initial,
            Channel::WebsocketStatus,
            Arc::clone(&dispatcher),
        ));
        Self {
            inner: Arc::new(LinkInner {
                settings,
                codec,
                status,
                dispatcher,
            }),
            task: BackgroundTask::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.settings.uri
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

impl ManagedService for LighthouseClient {
    fn start(&self) {
        let inner = Arc::clone(&self.inner);
        if !self.task.spawn(move |token| inner.supervise(token)) {
            log::warn!("Lighthouse client for {} is already running", self.inner.settings.uri);
        }
    }

    async fn shutdown(&self) {
        self.task.stop(STOP_GRACE).await;
    }
}

impl LinkInner {
    /// # Supervisor Loop
    async fn supervise(self: Arc<Self>, shutdown: CancellationToken) {
        let policy = self.settings.retry_policy();
        let mut pacer = RetryPacer::new(policy);
        let mut handler = FrameHandler::new(
            self.settings.max_can_frames,
            Arc::clone(&self.codec),
            Arc::clone(&self.status),
            Arc::clone(&self.dispatcher),
        );
        let mut session: Option<WsStream> = None;

        log::info!("Lighthouse supervisor started for {}", self.settings.uri);
        while !shutdown.is_cancelled() {
            if !pacer.wait_turn(&shutdown).await {
                break;
            }
            if let Some(at) = pacer.last_attempt() {
                self.status.update(|s| s.attempting(at));
            }

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };
            match connected {
                Ok(ws) => {
                    session = Some(ws);
                    let delay = policy.min_interval;
                    self.status.update(|s| s.connected_at(Utc::now(), delay));
                    log::info!("Connected to Lighthouse at {}", self.settings.uri);
                }
                Err(e) => {
                    let failures = self.status.snapshot().reconnect_attempts.saturating_add(1);
                    let delay = policy.delay_for(failures);
                    self.status.update(|s| s.retrying(e.kind(), delay, Utc::now()));
                    log::error!("{}. Retrying in {:.1}s (attempt {})", e, delay.as_secs_f64(), failures);
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            if let Some(ws) = session.as_mut() {
                match self.read_loop(ws, &mut handler, &shutdown).await {
                    ReadEnd::Shutdown => {}
                    ReadEnd::Lost(kind) => {
                        self.status.update(|s| s.failed_at(kind, Utc::now()));
                    }
                }
            }
            self.disconnect(&mut session).await;
        }

        self.disconnect(&mut session).await;
        log::info!("Lighthouse supervisor stopped for {}", self.settings.uri);
    }

    async fn connect(&self) -> Result<WsStream, LinkError> {
        let uri = self.settings.uri.as_str();
        log::debug!("Connecting to Lighthouse at {}", uri);
        match tokio::time::timeout(self.settings.connect_timeout(), connect_async(uri)).await {
            Err(_) => Err(LinkError::Timeout(uri.to_string())),
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(tungstenite::Error::Io(e))) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(LinkError::Refused(uri.to_string()))
            }
            Ok(Err(e)) => Err(LinkError::Handshake {
                uri: uri.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn read_loop(&self, ws: &mut WsStream, handler: &mut FrameHandler, shutdown: &CancellationToken) -> ReadEnd {
        let read_timeout = self.settings.read_timeout();
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = tokio::time::timeout(read_timeout, ws.next()) => Some(next),
            };
            let Some(next) = polled else {
                return ReadEnd::Shutdown;
            };

            match next {
                // Quiet period; poll again.
                Err(_) => continue,
                Ok(Some(Ok(Message::Binary(payload)))) => handler.handle_frame(payload),
                Ok(Some(Ok(Message::Text(text)))) => {
                    log::debug!("Ignoring {} byte text frame from Lighthouse", text.len());
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    log::warn!("Lighthouse closed the connection: {:?}", frame);
                    return ReadEnd::Lost(ErrorKind::ConnectionLost);
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))) | Ok(None) => {
                    log::warn!("Lighthouse stream ended");
                    return ReadEnd::Lost(ErrorKind::ConnectionLost);
                }
                Ok(Some(Err(e))) => {
                    log::error!("Lighthouse read error: {}", e);
                    return ReadEnd::Lost(ErrorKind::ProtocolError);
                }
            }
        }
    }

    /// Closes the session if there is one. Safe to call repeatedly.
    async fn disconnect(&self, session: &mut Option<WsStream>) {
        let Some(mut ws) = session.take() else {
            return;
        };
        if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await {
            log::debug!("Closing Lighthouse socket: {}", e);
        }
        self.status.update(ConnectionStatus::disconnected);
        log::info!("Disconnected from Lighthouse at {}", self.settings.uri);
    }
}
