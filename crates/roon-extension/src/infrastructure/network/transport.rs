//! WebSocket transport to a Core.
//!
//! The Core serves MOO over a WebSocket at `ws://<host>:<http_port>/api`, one
//! MOO frame per binary message.  After the upgrade the stream is split:
//!
//! - a **writer task** owns the sink.  [`WsTransport::send`] only queues bytes
//!   on an unbounded channel, so the synchronous [`Transport`] seam never
//!   blocks the event loop.  The writer also sends a WebSocket ping on every
//!   heartbeat tick.
//! - a **reader task** owns the stream and forwards every data message as a
//!   [`TransportEvent::Message`], followed by one [`TransportEvent::Closed`]
//!   when the socket ends.  Once the writer has stopped (a local close or a
//!   failed write) the peer gets [`CLOSE_TIMEOUT`] to finish the closing
//!   handshake before the reader gives up on it.
//!
//! The reader is started separately ([`WsReader::spawn`]) because inbound
//! traffic has to be tagged with a connection id, which only exists once the
//! transport has been handed to the extension.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::application::connection::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the TCP connect plus WebSocket upgrade may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the peer has to answer our WebSocket Close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for opening a Core connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("WebSocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: WsError,
    },
}

/// Inbound traffic from one transport, tagged with its connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { connection_id: u64, bytes: Vec<u8> },
    Closed { connection_id: u64 },
}

/// Builds the MOO endpoint URL for a Core.
pub fn websocket_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}/api")
    } else {
        format!("ws://{host}:{port}/api")
    }
}

// ── Writer side ───────────────────────────────────────────────────────────────

enum WriterCommand {
    Frame(Vec<u8>),
    Close,
}

/// The sending half of a Core WebSocket.
pub struct WsTransport {
    tx: mpsc::UnboundedSender<WriterCommand>,
    closed: AtomicBool,
}

impl Transport for WsTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(WriterCommand::Frame(bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // The writer may already have exited; nothing left to close then.
            let _ = self.tx.send(WriterCommand::Close);
        }
    }
}

/// `_stopped` is dropped when the writer exits, which starts the reader's
/// close deadline.
async fn run_writer(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    heartbeat: Duration,
    url: String,
    _stopped: oneshot::Sender<()>,
) {
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WriterCommand::Frame(bytes)) => {
                    if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                        warn!("{url}: write failed: {e}");
                        break;
                    }
                }
                Some(WriterCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    warn!("{url}: heartbeat failed: {e}");
                    break;
                }
            }
        }
    }
    debug!("{url}: writer stopped");
}

// ── Reader side ───────────────────────────────────────────────────────────────

/// The receiving half of a Core WebSocket, not yet running.
pub struct WsReader {
    stream: SplitStream<WsStream>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    writer_stopped: oneshot::Receiver<()>,
    close_timeout: Duration,
    url: String,
}

impl WsReader {
    /// Starts forwarding inbound messages as `connection_id`.
    pub fn spawn(self, connection_id: u64, events: mpsc::UnboundedSender<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(run_reader(self, connection_id, events))
    }
}

async fn run_reader(reader: WsReader, connection_id: u64, events: mpsc::UnboundedSender<TransportEvent>) {
    let WsReader {
        mut stream,
        writer,
        writer_stopped,
        close_timeout,
        url,
    } = reader;

    let loop_alive = tokio::select! {
        alive = forward_messages(&mut stream, connection_id, &events, &url) => alive,
        () = async {
            // Err only means the writer dropped its end, which is the signal.
            let _ = writer_stopped.await;
            sleep(close_timeout).await;
        } => {
            debug!("{url}: no close reply within {close_timeout:?}, dropping the socket");
            true
        }
    };
    if !loop_alive {
        return;
    }

    let _ = writer.send(WriterCommand::Close);
    let _ = events.send(TransportEvent::Closed { connection_id });
    info!("{url}: connection {connection_id} ended");
}

/// Forwards data messages until the socket ends.  Returns `false` if the
/// event loop went away first.
async fn forward_messages(
    stream: &mut SplitStream<WsStream>,
    connection_id: u64,
    events: &mpsc::UnboundedSender<TransportEvent>,
    url: &str,
) -> bool {
    while let Some(message) = stream.next().await {
        let bytes = match message {
            Ok(WsMessage::Binary(bytes)) => bytes,
            Ok(WsMessage::Text(text)) => text.into_bytes(),
            Ok(WsMessage::Close(frame)) => {
                debug!("{url}: closed by peer: {frame:?}");
                break;
            }
            // Pongs answer our heartbeat; tungstenite answers pings itself.
            Ok(_) => continue,
            Err(e) => {
                warn!("{url}: read failed: {e}");
                break;
            }
        };
        if events
            .send(TransportEvent::Message { connection_id, bytes })
            .is_err()
        {
            return false;
        }
    }
    true
}

// ── Connect ───────────────────────────────────────────────────────────────────

/// Opens the MOO WebSocket to `host:port` and starts its writer task.
///
/// # Errors
///
/// Returns [`ConnectError::Timeout`] if the upgrade does not finish within
/// [`CONNECT_TIMEOUT`], or [`ConnectError::Handshake`] if it fails.
pub async fn connect_websocket(
    host: &str,
    port: u16,
    heartbeat: Duration,
) -> Result<(Arc<WsTransport>, WsReader), ConnectError> {
    let url = websocket_url(host, port);
    let (ws, _response) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| ConnectError::Timeout(url.clone()))?
        .map_err(|source| ConnectError::Handshake {
            url: url.clone(),
            source,
        })?;
    info!("connected to {url}");

    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (stopped_tx, stopped_rx) = oneshot::channel();
    tokio::spawn(run_writer(sink, rx, heartbeat, url.clone(), stopped_tx));

    let transport = Arc::new(WsTransport {
        tx: tx.clone(),
        closed: AtomicBool::new(false),
    });
    let reader = WsReader {
        stream,
        writer: tx,
        writer_stopped: stopped_rx,
        close_timeout: CLOSE_TIMEOUT,
        url,
    };
    Ok((transport, reader))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
