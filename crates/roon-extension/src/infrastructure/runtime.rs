//! The event loop that drives an [`Extension`].
//!
//! # Architecture
//!
//! ```text
//!  ExtensionHandle ──┐
//!  connect tasks  ───┼─► loop events ─┐
//!                    │                ├─► EventLoop (owns Extension)
//!  WsReader tasks ───┴─► transport  ──┤
//!  SOOD task ──────────► discovered ──┘
//! ```
//!
//! Exactly one task owns the [`Extension`]; everything else talks to it over
//! channels, so no protocol state is ever locked.  Connecting is the only
//! slow step and runs in its own task, which posts the opened transport back
//! to the loop.
//!
//! After every event the loop publishes the paired flag, which the discovery
//! task reads to go quiet once a Core is paired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::connection::{ResponseStream, Subscription};
use crate::application::extension::{Extension, ExtensionError, ExtensionHooks};
use crate::domain::RemoteCore;
use crate::infrastructure::network::discovery::{
    start_discovery, DiscoveredCore, DiscoveryError, DiscoveryOptions, PeerTracker,
};
use crate::infrastructure::network::transport::{connect_websocket, ConnectError, TransportEvent, WsReader, WsTransport};
use crate::infrastructure::storage::config::ExtensionConfig;

/// Error type for [`ExtensionHandle`] calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("the extension runtime has stopped")]
    Stopped,

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Runtime settings.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub heartbeat_interval: Duration,
    /// `None` disables SOOD discovery.
    pub discovery: Option<DiscoveryOptions>,
}

impl RuntimeOptions {
    pub fn from_config(config: &ExtensionConfig) -> Self {
        Self {
            heartbeat_interval: config.transport.heartbeat_interval(),
            discovery: config
                .discovery
                .enabled
                .then(|| DiscoveryOptions::from(&config.discovery)),
        }
    }
}

// ── Host-facing events ────────────────────────────────────────────────────────

/// Core lifecycle events, as reported by [`ChannelHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Found(RemoteCore),
    Lost(RemoteCore),
    Paired(RemoteCore),
    Unpaired(RemoteCore),
}

/// [`ExtensionHooks`] that forward every event to a channel.
pub struct ChannelHooks {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelHooks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: CoreEvent) {
        // The host may not care to listen.
        let _ = self.tx.send(event);
    }
}

impl ExtensionHooks for ChannelHooks {
    fn core_found(&mut self, core: &RemoteCore) {
        self.emit(CoreEvent::Found(core.clone()));
    }

    fn core_lost(&mut self, core: &RemoteCore) {
        self.emit(CoreEvent::Lost(core.clone()));
    }

    fn core_paired(&mut self, core: &RemoteCore) {
        self.emit(CoreEvent::Paired(core.clone()));
    }

    fn core_unpaired(&mut self, core: &RemoteCore) {
        self.emit(CoreEvent::Unpaired(core.clone()));
    }
}

// ── Loop messages ─────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum Command {
    Connect {
        host: String,
        port: u16,
        reply: Reply<u64>,
    },
    Request {
        core_id: String,
        name: String,
        body: Option<Value>,
        reply: Reply<ResponseStream>,
    },
    Subscribe {
        core_id: String,
        service: String,
        stem: String,
        args: Option<Value>,
        reply: Reply<(Subscription, ResponseStream)>,
    },
    Unsubscribe {
        core_id: String,
        subscription: Subscription,
        reply: Reply<ResponseStream>,
    },
    Shutdown,
}

enum LoopEvent {
    Command(Command),
    Opened {
        transport: Arc<WsTransport>,
        reader: WsReader,
        /// SOOD `unique_id` when the connection came from discovery.
        peer: Option<String>,
        reply: Option<Reply<u64>>,
    },
    ConnectFailed {
        error: ConnectError,
        peer: Option<String>,
        reply: Option<Reply<u64>>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running extension.
#[derive(Clone)]
pub struct ExtensionHandle {
    events: mpsc::UnboundedSender<LoopEvent>,
    paired: Arc<AtomicBool>,
}

impl ExtensionHandle {
    /// Connects to a Core at `host:port` directly, bypassing discovery.
    /// Resolves once the WebSocket is open; registration continues in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Connect`] if the connection cannot be opened.
    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<u64, RuntimeError> {
        let host = host.into();
        self.call(|reply| Command::Connect { host, port, reply }).await
    }

    /// Sends `REQUEST <name>` to the registered Core `core_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Extension`] for an unknown Core or a malformed
    /// name.
    pub async fn request(
        &self,
        core_id: impl Into<String>,
        name: impl Into<String>,
        body: Option<Value>,
    ) -> Result<ResponseStream, RuntimeError> {
        let core_id = core_id.into();
        let name = name.into();
        self.call(|reply| Command::Request {
            core_id,
            name,
            body,
            reply,
        })
        .await
    }

    /// Subscribes to `service/subscribe_<stem>` on the Core `core_id`.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn subscribe(
        &self,
        core_id: impl Into<String>,
        service: impl Into<String>,
        stem: impl Into<String>,
        args: Option<Value>,
    ) -> Result<(Subscription, ResponseStream), RuntimeError> {
        let core_id = core_id.into();
        let service = service.into();
        let stem = stem.into();
        self.call(|reply| Command::Subscribe {
            core_id,
            service,
            stem,
            args,
            reply,
        })
        .await
    }

    /// Ends a subscription opened with [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn unsubscribe(
        &self,
        core_id: impl Into<String>,
        subscription: Subscription,
    ) -> Result<ResponseStream, RuntimeError> {
        let core_id = core_id.into();
        self.call(|reply| Command::Unsubscribe {
            core_id,
            subscription,
            reply,
        })
        .await
    }

    /// Asks the loop to close every connection and stop.
    pub fn shutdown(&self) {
        let _ = self.events.send(LoopEvent::Command(Command::Shutdown));
    }

    /// Whether a paired Core is currently connected.
    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::Relaxed)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(LoopEvent::Command(build(tx)))
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

/// Entry point for running an [`Extension`].
pub struct ExtensionRuntime;

impl ExtensionRuntime {
    /// Spawns the event loop and, if enabled, SOOD discovery.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Discovery`] if discovery is enabled and the
    /// network interfaces cannot be listed.
    pub fn start(
        extension: Extension,
        options: RuntimeOptions,
    ) -> Result<(ExtensionHandle, JoinHandle<()>), RuntimeError> {
        let paired = Arc::new(AtomicBool::new(extension.is_paired()));
        let running = Arc::new(AtomicBool::new(true));

        let discovered = match options.discovery {
            Some(discovery) => {
                let (rx, _task) = start_discovery(discovery, Arc::clone(&paired), Arc::clone(&running))?;
                Some(rx)
            }
            None => None,
        };
        Ok(Self::spawn_loop(
            extension,
            options.heartbeat_interval,
            paired,
            running,
            discovered,
        ))
    }

    /// Spawns the loop over an already running announcement source.
    fn spawn_loop(
        extension: Extension,
        heartbeat: Duration,
        paired: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        discovered: Option<mpsc::UnboundedReceiver<DiscoveredCore>>,
    ) -> (ExtensionHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            extension,
            heartbeat,
            events: events_tx.clone(),
            transport: transport_tx,
            peers: PeerTracker::default(),
            peer_of: HashMap::new(),
            paired: Arc::clone(&paired),
            running,
        };
        let task = tokio::spawn(event_loop.run(events_rx, transport_rx, discovered));

        let handle = ExtensionHandle {
            events: events_tx,
            paired,
        };
        (handle, task)
    }
}

struct EventLoop {
    extension: Extension,
    heartbeat: Duration,
    events: mpsc::UnboundedSender<LoopEvent>,
    transport: mpsc::UnboundedSender<TransportEvent>,
    peers: PeerTracker,
    /// Discovery `unique_id` per connection, released on close.
    peer_of: HashMap<u64, String>,
    paired: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

async fn next_discovered(rx: &mut Option<mpsc::UnboundedReceiver<DiscoveredCore>>) -> Option<DiscoveredCore> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LoopEvent>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut discovered: Option<mpsc::UnboundedReceiver<DiscoveredCore>>,
    ) {
        info!("extension runtime started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LoopEvent::Command(Command::Shutdown)) | None => break,
                    Some(event) => self.on_event(event),
                },
                Some(event) = transport.recv() => self.on_transport(event),
                core = next_discovered(&mut discovered) => match core {
                    Some(core) => self.on_discovered(core),
                    None => {
                        warn!("discovery stopped");
                        discovered = None;
                    }
                },
            }
            self.paired.store(self.extension.is_paired(), Ordering::Relaxed);
        }

        self.running.store(false, Ordering::Relaxed);
        self.extension.shutdown();
        self.paired.store(false, Ordering::Relaxed);
        info!("extension runtime stopped");
    }

    fn on_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command(command) => self.on_command(command),
            LoopEvent::Opened {
                transport,
                reader,
                peer,
                reply,
            } => {
                let id = self.extension.open_connection(transport);
                reader.spawn(id, self.transport.clone());
                if let Some(peer) = peer {
                    self.peer_of.insert(id, peer);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(id));
                }
            }
            LoopEvent::ConnectFailed { error, peer, reply } => {
                warn!("connect failed: {error}");
                if let Some(peer) = peer {
                    self.peers.release(&peer);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error.into()));
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port, reply } => self.spawn_connect(host, port, None, Some(reply)),
            Command::Request {
                core_id,
                name,
                body,
                reply,
            } => {
                let result = self.extension.send_request(&core_id, &name, body);
                let _ = reply.send(result.map_err(RuntimeError::from));
            }
            Command::Subscribe {
                core_id,
                service,
                stem,
                args,
                reply,
            } => {
                let result = self.extension.subscribe(&core_id, &service, &stem, args);
                let _ = reply.send(result.map_err(RuntimeError::from));
            }
            Command::Unsubscribe {
                core_id,
                subscription,
                reply,
            } => {
                let result = self.extension.unsubscribe(&core_id, subscription);
                let _ = reply.send(result.map_err(RuntimeError::from));
            }
            // Handled by the loop itself.
            Command::Shutdown => {}
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { connection_id, bytes } => {
                self.extension.handle_message(connection_id, &bytes);
            }
            TransportEvent::Closed { connection_id } => {
                self.extension.close_connection(connection_id);
                if let Some(peer) = self.peer_of.remove(&connection_id) {
                    self.peers.release(&peer);
                }
            }
        }
    }

    fn on_discovered(&mut self, core: DiscoveredCore) {
        let DiscoveredCore { announcement, address } = core;
        if !self.peers.try_begin(&announcement.unique_id) {
            return;
        }
        info!(
            "discovered core {} at {address}:{}",
            announcement.unique_id, announcement.http_port
        );
        self.spawn_connect(
            address.to_string(),
            announcement.http_port,
            Some(announcement.unique_id),
            None,
        );
    }

    fn spawn_connect(&self, host: String, port: u16, peer: Option<String>, reply: Option<Reply<u64>>) {
        let events = self.events.clone();
        let heartbeat = self.heartbeat;
        tokio::spawn(async move {
            debug!("connecting to {host}:{port}");
            let event = match connect_websocket(&host, port, heartbeat).await {
                Ok((transport, reader)) => LoopEvent::Opened {
                    transport,
                    reader,
                    peer,
                    reply,
                },
                Err(error) => LoopEvent::ConnectFailed { error, peer, reply },
            };
            // Fails only if the loop already stopped.
            let _ = events.send(event);
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
