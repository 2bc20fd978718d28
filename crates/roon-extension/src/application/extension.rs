//! The extension context: every connection, the service catalogue, pairing,
//! and persisted state, owned in one place.
//!
//! # How a Core is brought up (for beginners)
//!
//! 1. [`Extension::open_connection`] wraps a freshly opened transport and
//!    sends `registry/info`.
//! 2. The `info` reply names the Core.  If a token for that Core was saved
//!    earlier it goes into the `register` request, so the Core recognises us.
//! 3. `Registered` carries a (possibly new) token, which is persisted.  The
//!    Core is now a [`RemoteCore`]; the pairing machine and host hooks hear
//!    about it.
//! 4. From then on the Core calls our services (ping, pairing, and whatever
//!    the host registered) and the host can call the Core's services through
//!    [`Extension::send_request`] and [`Extension::subscribe`].
//!
//! When the transport closes, [`Extension::close_connection`] fails every
//! outstanding request, retires the connection's subscriptions, and reports
//! the Core lost.
//!
//! All methods are synchronous; the event loop in
//! [`crate::infrastructure::runtime`] is the only caller in production.

use std::collections::HashMap;
use std::sync::Arc;

use moo_core::{decode_frame, Body, Frame};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::connection::{
    Connection, ConnectionError, HandshakeStep, Inbound, Reply, Response, ResponseStream,
    Subscription, Transport,
};
use crate::application::pairing::{PairingEffect, PairingMachine};
use crate::application::registry::{
    RegistryError, Request, ServiceRegistry, ServiceSpec, SubscriptionSpec, Subscriptions,
    INVALID_REQUEST,
};
use crate::domain::{CoreInfo, ExtensionInfo, MetadataError, Registered, RegistrationInfo, RemoteCore};
use crate::infrastructure::storage::config::{ExtensionConfig, FrameLogLevel};
use crate::infrastructure::storage::state::{PersistedState, StateStore, StoreError};

/// Liveness service every extension provides.
pub const PING_SERVICE: &str = "com.roonlabs.ping:1";

/// Pairing service, provided when pairing is enabled.
pub const PAIRING_SERVICE: &str = "com.roonlabs.pairing:1";

const PAIRING_SUBSCRIPTION: &str = "subscribe_pairing";

/// Errors returned by [`Extension`] operations.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("failed to load pairing state: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("no registered connection to core {0}")]
    UnknownCore(String),
}

/// Host callbacks for Core lifecycle events.
///
/// With pairing enabled only `core_paired` / `core_unpaired` fire, and only for
/// the paired Core.  With pairing disabled, `core_found` / `core_lost` fire for
/// every Core.  All hooks run on the event loop and must not block.
pub trait ExtensionHooks: Send {
    fn core_found(&mut self, _core: &RemoteCore) {}
    fn core_lost(&mut self, _core: &RemoteCore) {}
    fn core_paired(&mut self, _core: &RemoteCore) {}
    fn core_unpaired(&mut self, _core: &RemoteCore) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoHooks;

impl ExtensionHooks for NoHooks {}

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct ExtensionOptions {
    pub info: ExtensionInfo,
    pub pairing_enabled: bool,
    pub log_level: FrameLogLevel,
}

impl ExtensionOptions {
    pub fn from_config(config: &ExtensionConfig) -> Self {
        Self {
            info: config.extension.info(),
            pairing_enabled: config.pairing.enabled,
            log_level: config.extension.log_level,
        }
    }
}

// ── Handler context ───────────────────────────────────────────────────────────

/// State handed to every service handler.
pub struct ExtensionState {
    pairing: Option<PairingMachine>,
    persisted: PersistedState,
    store: Box<dyn StateStore>,
    hooks: Box<dyn ExtensionHooks>,
    remotes: HashMap<u64, RemoteCore>,
}

impl ExtensionState {
    /// The Core registered on `connection_id`.
    pub fn remote(&self, connection_id: u64) -> Option<&RemoteCore> {
        self.remotes.get(&connection_id)
    }

    /// Every registered Core.
    pub fn remotes(&self) -> impl Iterator<Item = &RemoteCore> {
        self.remotes.values()
    }

    pub fn paired_core_id(&self) -> Option<&str> {
        self.pairing.as_ref().and_then(PairingMachine::paired_core_id)
    }

    /// Whether any registered connection from `core_id` is open.
    pub fn is_connected(&self, core_id: &str) -> bool {
        self.remotes.values().any(|c| c.core_id == core_id)
    }

    pub fn is_paired(&self) -> bool {
        self.pairing.as_ref().is_some_and(PairingMachine::is_paired)
    }

    fn pairing_body(&self) -> Value {
        match self.paired_core_id() {
            Some(id) => json!({ "paired_core_id": id }),
            None => json!({}),
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.persisted) {
            error!("failed to save pairing state: {e}");
        }
    }

    fn core_found(&mut self, subs: Option<&Subscriptions>, core: &RemoteCore) {
        match self.pairing.as_mut() {
            Some(machine) => {
                let effects = machine.found(core);
                self.apply(subs, effects);
            }
            None => self.hooks.core_found(core),
        }
    }

    fn core_lost(&mut self, subs: Option<&Subscriptions>, core: &RemoteCore) {
        match self.pairing.as_mut() {
            Some(machine) => {
                let effects = machine.lost(core);
                self.apply(subs, effects);
            }
            None => self.hooks.core_lost(core),
        }
    }

    fn apply(&mut self, subs: Option<&Subscriptions>, effects: Vec<PairingEffect>) {
        for effect in effects {
            match effect {
                PairingEffect::Persist => {
                    self.persisted.paired_core_id = self.paired_core_id().map(str::to_string);
                    self.persist();
                }
                PairingEffect::Broadcast(core_id) => {
                    if let Some(subs) = subs {
                        subs.send_continue_all(
                            PAIRING_SUBSCRIPTION,
                            "Changed",
                            Some(json!({ "paired_core_id": core_id })),
                        );
                    }
                }
                PairingEffect::Paired(core) => {
                    info!("paired with core {core}");
                    self.hooks.core_paired(&core);
                }
                PairingEffect::Unpaired(core) => {
                    info!("unpaired from core {core}");
                    self.hooks.core_unpaired(&core);
                }
            }
        }
    }

    /// Handler for `pairing/pair`.
    fn pair_requesting_core(&mut self, subs: &Subscriptions, request: &Request) {
        let Some(core) = self.remotes.get(&request.connection_id).cloned() else {
            request.send_complete(
                INVALID_REQUEST,
                Some(json!({ "error": "pair requested before registration" })),
            );
            return;
        };
        let previous = self
            .paired_core_id()
            .and_then(|id| self.remotes.values().find(|c| c.core_id == id))
            .cloned();
        if let Some(machine) = self.pairing.as_mut() {
            let effects = machine.pair(&core, previous.as_ref());
            self.apply(Some(subs), effects);
        }
        request.send_complete("Success", None);
    }
}

// ── Extension ─────────────────────────────────────────────────────────────────

/// Owns every connection and all protocol state.
pub struct Extension {
    info: ExtensionInfo,
    log_level: FrameLogLevel,
    registry: ServiceRegistry<ExtensionState>,
    state: ExtensionState,
    connections: HashMap<u64, Connection>,
}

impl Extension {
    /// Validates metadata, loads persisted state, and registers the built-in
    /// services.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::Metadata`] for incomplete metadata and
    /// [`ExtensionError::Store`] if persisted state cannot be read.
    pub fn new(
        options: ExtensionOptions,
        store: Box<dyn StateStore>,
        hooks: Box<dyn ExtensionHooks>,
    ) -> Result<Self, ExtensionError> {
        options.info.validate()?;
        let persisted = store.load()?;
        let pairing = options
            .pairing_enabled
            .then(|| PairingMachine::new(persisted.paired_core_id.clone()));

        let mut registry = ServiceRegistry::new();
        registry.register_service(ping_service())?;
        if options.pairing_enabled {
            registry.register_service(pairing_service())?;
        }

        Ok(Self {
            info: options.info,
            log_level: options.log_level,
            registry,
            state: ExtensionState {
                pairing,
                persisted,
                store,
                hooks,
                remotes: HashMap::new(),
            },
            connections: HashMap::new(),
        })
    }

    /// Adds a host service.  Register services before connecting: the list
    /// of provided services is sent during registration.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::Registry`] on a name clash.
    pub fn register_service(&mut self, spec: ServiceSpec<ExtensionState>) -> Result<(), ExtensionError> {
        Ok(self.registry.register_service(spec)?)
    }

    pub fn state(&self) -> &ExtensionState {
        &self.state
    }

    /// Subscriptions of a provided service, for pushing updates.
    pub fn subscriptions(&self, service: &str) -> Option<&Subscriptions> {
        self.registry.subscriptions(service)
    }

    pub fn subscriptions_mut(&mut self, service: &str) -> Option<&mut Subscriptions> {
        self.registry.subscriptions_mut(service)
    }

    pub fn is_paired(&self) -> bool {
        self.state.is_paired()
    }

    pub fn paired_core_id(&self) -> Option<&str> {
        self.state.paired_core_id()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wraps a newly opened transport and starts the handshake.  Returns the
    /// connection id the transport's inbound traffic must be tagged with.
    pub fn open_connection(&mut self, transport: Arc<dyn Transport>) -> u64 {
        let mut conn = Connection::open(transport, self.log_level);
        let id = conn.id();
        if let Err(e) = conn.begin_handshake() {
            warn!("connection {id}: handshake could not start: {e}");
            conn.close(&mut self.registry, &mut self.state);
            return id;
        }
        self.connections.insert(id, conn);
        id
    }

    /// Decodes and handles every frame in one transport message.  A malformed
    /// frame closes the connection.
    pub fn handle_message(&mut self, connection_id: u64, bytes: &[u8]) {
        let mut cursor = 0;
        while cursor < bytes.len() {
            match decode_frame(&bytes[cursor..]) {
                Ok((frame, consumed)) => {
                    cursor += consumed;
                    self.handle_frame(connection_id, frame);
                }
                Err(e) => {
                    warn!("connection {connection_id}: malformed frame: {e}");
                    self.close_connection(connection_id);
                    return;
                }
            }
        }
    }

    /// Handles one decoded frame.
    pub fn handle_frame(&mut self, connection_id: u64, frame: Frame) {
        let Some(conn) = self.connections.get_mut(&connection_id) else {
            debug!("frame for unknown connection {connection_id} dropped");
            return;
        };
        match conn.dispatch_inbound(frame) {
            Inbound::Request(frame) => {
                let reply = conn.reply_sink(&frame);
                let request = Request::new(connection_id, frame, reply);
                self.registry.dispatch(&mut self.state, request);
            }
            Inbound::Handshake(step, response) => self.on_handshake(connection_id, step, response),
            Inbound::Delivered | Inbound::UnknownRequest(_) | Inbound::Ignored => {}
        }
    }

    /// Closes a connection and reports its Core lost.  Returns `false` if the
    /// connection was unknown or already closed.
    pub fn close_connection(&mut self, connection_id: u64) -> bool {
        let Some(mut conn) = self.connections.remove(&connection_id) else {
            return false;
        };
        conn.close(&mut self.registry, &mut self.state);

        if let Some(core) = self.state.remotes.remove(&connection_id) {
            // A Core reached over several connections is lost with the last one.
            if self.state.is_connected(&core.core_id) {
                debug!("connection {connection_id} to core {core} closed, others remain");
            } else {
                info!("lost core {core}");
                let subs = self.registry.subscriptions(PAIRING_SERVICE);
                self.state.core_lost(subs, &core);
            }
        }
        true
    }

    /// Closes every connection.
    pub fn shutdown(&mut self) {
        let ids: Vec<u64> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    /// Sends `REQUEST <name>` to a registered Core.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownCore`] if no connection to `core_id` is
    /// registered, or [`ExtensionError::Connection`] for an invalid name.
    pub fn send_request(
        &mut self,
        core_id: &str,
        name: &str,
        body: Option<Value>,
    ) -> Result<ResponseStream, ExtensionError> {
        let conn = self.connection_for_core(core_id)?;
        Ok(conn.send_request(name, body.map(Body::Json))?)
    }

    /// Subscribes to `service/subscribe_<stem>` on a registered Core.
    ///
    /// # Errors
    ///
    /// Same as [`send_request`](Self::send_request).
    pub fn subscribe(
        &mut self,
        core_id: &str,
        service: &str,
        stem: &str,
        args: Option<Value>,
    ) -> Result<(Subscription, ResponseStream), ExtensionError> {
        let conn = self.connection_for_core(core_id)?;
        Ok(conn.subscribe(service, stem, args)?)
    }

    /// Ends a subscription opened with [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// Same as [`send_request`](Self::send_request).
    pub fn unsubscribe(&mut self, core_id: &str, subscription: Subscription) -> Result<ResponseStream, ExtensionError> {
        let conn = self.connection_for_core(core_id)?;
        Ok(subscription.unsubscribe(conn)?)
    }

    fn connection_for_core(&mut self, core_id: &str) -> Result<&mut Connection, ExtensionError> {
        let id = self
            .state
            .remotes
            .values()
            .find(|c| c.core_id == core_id)
            .map(|c| c.connection_id)
            .ok_or_else(|| ExtensionError::UnknownCore(core_id.to_string()))?;
        self.connections
            .get_mut(&id)
            .ok_or_else(|| ExtensionError::UnknownCore(core_id.to_string()))
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    fn on_handshake(&mut self, connection_id: u64, step: HandshakeStep, response: Response) {
        match (step, response) {
            (HandshakeStep::Info, Response::Completed(reply)) => self.on_core_info(connection_id, reply),
            (HandshakeStep::Register, Response::Continued(reply) | Response::Completed(reply)) => {
                self.on_registered(connection_id, reply)
            }
            (step, response) => {
                warn!("connection {connection_id}: unexpected {step:?} reply {response:?}");
                self.close_connection(connection_id);
            }
        }
    }

    fn on_core_info(&mut self, connection_id: u64, reply: Reply) {
        let info = match parse_body::<CoreInfo>(&reply) {
            Some(info) if reply.name == "Success" => info,
            _ => {
                warn!("connection {connection_id}: bad info reply {}", reply.name);
                self.close_connection(connection_id);
                return;
            }
        };
        debug!("connection {connection_id}: core {} ({})", info.core_id, info.display_name);

        let registration = RegistrationInfo {
            extension: self.info.clone(),
            provided_services: self.registry.provided_services(),
            token: self.state.persisted.tokens.get(&info.core_id).cloned(),
        };
        let sent = serde_json::to_value(&registration)
            .map_err(|e| e.to_string())
            .and_then(|body| match self.connections.get_mut(&connection_id) {
                Some(conn) => conn.send_register(body).map_err(|e| e.to_string()),
                None => Err("connection gone".to_string()),
            });
        if let Err(e) = sent {
            warn!("connection {connection_id}: register not sent: {e}");
            self.close_connection(connection_id);
        }
    }

    fn on_registered(&mut self, connection_id: u64, reply: Reply) {
        if reply.name != "Registered" {
            warn!(
                "connection {connection_id}: registration refused: {} {:?}",
                reply.name,
                reply.json()
            );
            return;
        }
        let Some(registered) = parse_body::<Registered>(&reply) else {
            warn!("connection {connection_id}: malformed Registered body");
            self.close_connection(connection_id);
            return;
        };
        let Some(conn) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if conn.remote().is_some() {
            debug!("connection {connection_id}: duplicate Registered ignored");
            return;
        }

        let core = RemoteCore {
            core_id: registered.core_id,
            display_name: registered.display_name,
            display_version: registered.display_version,
            connection_id,
            provided_services: registered.provided_services,
        };
        conn.set_remote(core.clone());
        self.state
            .persisted
            .tokens
            .insert(core.core_id.clone(), registered.token);
        self.state.persist();
        let already_connected = self.state.is_connected(&core.core_id);
        self.state.remotes.insert(connection_id, core.clone());
        if already_connected {
            info!("registered again with core {core}");
            return;
        }
        info!("registered with core {core}");

        let subs = self.registry.subscriptions(PAIRING_SERVICE);
        self.state.core_found(subs, &core);
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(reply: &Reply) -> Option<T> {
    reply
        .json()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

// ── Built-in services ─────────────────────────────────────────────────────────

fn ping_service() -> ServiceSpec<ExtensionState> {
    ServiceSpec::new(PING_SERVICE).method("ping", |_: &mut ExtensionState, _, req| {
        req.send_complete("Success", None);
    })
}

fn pairing_service() -> ServiceSpec<ExtensionState> {
    ServiceSpec::new(PAIRING_SERVICE)
        .method("get_pairing", |state: &mut ExtensionState, _, req| {
            req.send_complete("Success", Some(state.pairing_body()));
        })
        .method("pair", |state: &mut ExtensionState, subs, req| {
            state.pair_requesting_core(subs, &req);
        })
        .subscription(SubscriptionSpec::new(
            PAIRING_SUBSCRIPTION,
            "unsubscribe_pairing",
            |state: &mut ExtensionState, _, req| {
                req.send_continue("Subscribed", Some(state.pairing_body()));
                Ok(())
            },
        ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::mock::MockTransport;
    use crate::infrastructure::storage::state::{MemoryStateStore, MockStateStore};
    use moo_core::{encode_frame, Verb};
    use std::sync::Mutex;

    /// Hooks that record every call as `"<event>:<core_id>"`.
    #[derive(Clone, Default)]
    struct RecordingHooks {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHooks {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("lock poisoned").clone()
        }

        fn push(&self, event: &str, core: &RemoteCore) {
            self.events
                .lock()
                .expect("lock poisoned")
                .push(format!("{event}:{}", core.core_id));
        }
    }

    impl ExtensionHooks for RecordingHooks {
        fn core_found(&mut self, core: &RemoteCore) {
            self.push("found", core);
        }
        fn core_lost(&mut self, core: &RemoteCore) {
            self.push("lost", core);
        }
        fn core_paired(&mut self, core: &RemoteCore) {
            self.push("paired", core);
        }
        fn core_unpaired(&mut self, core: &RemoteCore) {
            self.push("unpaired", core);
        }
    }

    fn options(pairing_enabled: bool) -> ExtensionOptions {
        ExtensionOptions {
            info: ExtensionConfig::default().extension.info(),
            pairing_enabled,
            log_level: FrameLogLevel::Normal,
        }
    }

    fn extension(pairing_enabled: bool, store: MemoryStateStore) -> (Extension, RecordingHooks) {
        let hooks = RecordingHooks::default();
        let ext = Extension::new(options(pairing_enabled), Box::new(store), Box::new(hooks.clone()))
            .expect("extension");
        (ext, hooks)
    }

    fn feed(ext: &mut Extension, conn: u64, frame: Frame) {
        let bytes = encode_frame(&frame).expect("encode");
        ext.handle_message(conn, &bytes);
    }

    /// Opens a connection and completes the handshake as `core_id`.
    fn register(ext: &mut Extension, core_id: &str) -> (u64, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let conn = ext.open_connection(transport.clone());

        let info = transport.last_frame().expect("info request");
        feed(
            ext,
            conn,
            Frame::reply(
                Verb::Complete,
                info.request_id,
                "Success",
                Some(json!({"core_id": core_id, "display_name": "Core", "display_version": "2.0"}).into()),
            ),
        );
        let register = transport.last_frame().expect("register request");
        assert_eq!(register.name, "register");
        feed(
            ext,
            conn,
            Frame::reply(
                Verb::Continue,
                register.request_id,
                "Registered",
                Some(
                    json!({
                        "core_id": core_id,
                        "display_name": "Core",
                        "display_version": "2.0",
                        "token": format!("token-{core_id}"),
                        "provided_services": ["com.roonlabs.transport:2"],
                    })
                    .into(),
                ),
            ),
        );
        transport.clear();
        (conn, transport)
    }

    fn call(ext: &mut Extension, conn: u64, transport: &MockTransport, service: &str, method: &str, body: Option<Value>) -> Frame {
        feed(ext, conn, Frame::request("900", service, method, body.map(Body::Json)));
        transport.last_frame().expect("reply")
    }

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn test_new_rejects_incomplete_metadata() {
        let mut opts = options(true);
        opts.info.extension_id = String::new();

        let result = Extension::new(opts, Box::new(MemoryStateStore::default()), Box::new(NoHooks));

        assert!(matches!(result, Err(ExtensionError::Metadata(_))));
    }

    #[test]
    fn test_pairing_service_only_registered_when_enabled() {
        let (with, _) = extension(true, MemoryStateStore::default());
        let (without, _) = extension(false, MemoryStateStore::default());

        assert!(with.subscriptions(PAIRING_SERVICE).is_some());
        assert!(without.subscriptions(PAIRING_SERVICE).is_none());
        assert!(without.subscriptions(PING_SERVICE).is_some());
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    #[test]
    fn test_handshake_registers_core_and_persists_token() {
        // Arrange
        let store = MemoryStateStore::default();
        let (mut ext, hooks) = extension(true, store.clone());

        // Act
        let (conn, _) = register(&mut ext, "core-a");

        // Assert
        let remote = ext.state().remote(conn).expect("remote");
        assert_eq!(remote.core_id, "core-a");
        assert_eq!(remote.provided_services, vec!["com.roonlabs.transport:2"]);
        assert!(remote.provides("com.roonlabs.transport:2"));
        let saved = store.snapshot();
        assert_eq!(saved.tokens.get("core-a").map(String::as_str), Some("token-core-a"));
        assert_eq!(saved.paired_core_id.as_deref(), Some("core-a"));
        assert!(ext.is_paired());
        assert_eq!(hooks.events(), vec!["paired:core-a"]);
    }

    #[test]
    fn test_register_request_carries_metadata_services_and_saved_token() {
        // Arrange
        let mut saved = PersistedState::default();
        saved.tokens.insert("core-a".into(), "old-token".into());
        let (mut ext, _) = extension(true, MemoryStateStore::new(saved));
        let transport = Arc::new(MockTransport::new());
        let conn = ext.open_connection(transport.clone());
        let info = transport.last_frame().unwrap();
        assert_eq!(info.target(), "com.roonlabs.registry:1/info");

        // Act
        feed(
            &mut ext,
            conn,
            Frame::reply(
                Verb::Complete,
                info.request_id,
                "Success",
                Some(json!({"core_id": "core-a", "display_name": "C", "display_version": "1"}).into()),
            ),
        );

        // Assert
        let register = transport.last_frame().unwrap();
        let body = register.json().unwrap();
        assert_eq!(register.target(), "com.roonlabs.registry:1/register");
        assert_eq!(body["token"], "old-token");
        assert_eq!(body["extension_id"], "org.example.roon-extension");
        assert_eq!(body["provided_services"], json!([PAIRING_SERVICE, PING_SERVICE]));
    }

    #[test]
    fn test_refused_registration_leaves_core_unregistered() {
        let (mut ext, hooks) = extension(true, MemoryStateStore::default());
        let transport = Arc::new(MockTransport::new());
        let conn = ext.open_connection(transport.clone());
        let info = transport.last_frame().unwrap();
        feed(
            &mut ext,
            conn,
            Frame::reply(
                Verb::Complete,
                info.request_id,
                "Success",
                Some(json!({"core_id": "c", "display_name": "C", "display_version": "1"}).into()),
            ),
        );
        let register = transport.last_frame().unwrap();

        feed(&mut ext, conn, Frame::reply(Verb::Complete, register.request_id, "NotAllowed", None));

        assert!(ext.state().remote(conn).is_none());
        assert!(hooks.events().is_empty());
    }

    #[test]
    fn test_malformed_frame_closes_connection() {
        let (mut ext, _) = extension(true, MemoryStateStore::default());
        let transport = Arc::new(MockTransport::new());
        let conn = ext.open_connection(transport.clone());

        ext.handle_message(conn, b"MOO/1 NONSENSE\n\n");

        assert_eq!(ext.connection_count(), 0);
        assert!(transport.is_closed());
    }

    // ── Built-in services ────────────────────────────────────────────────────

    #[test]
    fn test_ping_completes_with_success() {
        let (mut ext, _) = extension(true, MemoryStateStore::default());
        let (conn, transport) = register(&mut ext, "core-a");

        let reply = call(&mut ext, conn, &transport, PING_SERVICE, "ping", None);

        assert_eq!(reply, Frame::reply(Verb::Complete, "900", "Success", None));
    }

    #[test]
    fn test_get_pairing_reports_paired_core() {
        let (mut ext, _) = extension(true, MemoryStateStore::default());
        let (conn, transport) = register(&mut ext, "core-a");

        let reply = call(&mut ext, conn, &transport, PAIRING_SERVICE, "get_pairing", None);

        assert_eq!(reply.name, "Success");
        assert_eq!(reply.json(), Some(&json!({"paired_core_id": "core-a"})));
    }

    #[test]
    fn test_pair_moves_pairing_and_notifies_subscribers() {
        // Arrange
        let (mut ext, hooks) = extension(true, MemoryStateStore::default());
        let (conn_a, transport_a) = register(&mut ext, "A");
        let (conn_b, transport_b) = register(&mut ext, "B");
        let sub = call(
            &mut ext,
            conn_a,
            &transport_a,
            PAIRING_SERVICE,
            "subscribe_pairing",
            Some(json!({"subscription_key": 1})),
        );
        assert_eq!(sub.name, "Subscribed");

        // Act
        let reply = call(&mut ext, conn_b, &transport_b, PAIRING_SERVICE, "pair", None);

        // Assert
        assert_eq!(reply.name, "Success");
        assert_eq!(ext.paired_core_id(), Some("B"));
        assert!(ext.is_paired());
        assert_eq!(hooks.events(), vec!["paired:A", "unpaired:A", "paired:B"]);
        let changed = transport_a.last_frame().unwrap();
        assert_eq!(changed.verb, Verb::Continue);
        assert_eq!(changed.name, "Changed");
        assert_eq!(changed.json(), Some(&json!({"paired_core_id": "B"})));
    }

    #[test]
    fn test_pair_from_paired_core_changes_nothing() {
        let (mut ext, hooks) = extension(true, MemoryStateStore::default());
        let (conn, transport) = register(&mut ext, "A");

        call(&mut ext, conn, &transport, PAIRING_SERVICE, "pair", None);

        assert_eq!(hooks.events(), vec!["paired:A"]);
        assert_eq!(ext.paired_core_id(), Some("A"));
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    #[test]
    fn test_closing_paired_core_unpairs_and_fails_outstanding_requests() {
        // Arrange
        let (mut ext, hooks) = extension(true, MemoryStateStore::default());
        let (conn, _) = register(&mut ext, "A");
        let mut stream = ext.send_request("A", "com.roonlabs.transport:2/get_zones", None).unwrap();

        // Act
        let closed = ext.close_connection(conn);
        let again = ext.close_connection(conn);

        // Assert
        assert!(closed);
        assert!(!again);
        assert_eq!(stream.try_next(), Some(Response::Closed));
        assert!(!ext.is_paired());
        assert_eq!(ext.paired_core_id(), Some("A"));
        assert_eq!(hooks.events(), vec!["paired:A", "unpaired:A"]);
    }

    #[test]
    fn test_paired_core_stays_paired_while_another_connection_is_open() {
        // Arrange
        let (mut ext, hooks) = extension(true, MemoryStateStore::default());
        let (first, _) = register(&mut ext, "A");
        let (second, _) = register(&mut ext, "A");

        // Act
        ext.close_connection(first);

        // Assert
        assert!(ext.is_paired());
        assert!(ext.state().is_connected("A"));
        assert_eq!(hooks.events(), vec!["paired:A"]);

        ext.close_connection(second);
        assert!(!ext.is_paired());
        assert!(!ext.state().is_connected("A"));
        assert_eq!(hooks.events(), vec!["paired:A", "unpaired:A"]);
    }

    #[test]
    fn test_second_connection_keeps_core_reachable_for_requests() {
        let (mut ext, _) = extension(false, MemoryStateStore::default());
        let (first, _) = register(&mut ext, "A");
        let (_, second_transport) = register(&mut ext, "A");

        ext.close_connection(first);
        let _stream = ext
            .send_request("A", "com.roonlabs.transport:2/get_zones", None)
            .expect("second connection still serves the core");

        let sent = second_transport.last_frame().expect("request");
        assert_eq!(sent.target(), "com.roonlabs.transport:2/get_zones");
    }

    #[test]
    fn test_without_pairing_every_core_is_found_and_lost() {
        let (mut ext, hooks) = extension(false, MemoryStateStore::default());
        let (a, _) = register(&mut ext, "A");
        register(&mut ext, "B");

        ext.close_connection(a);

        assert_eq!(hooks.events(), vec!["found:A", "found:B", "lost:A"]);
        assert!(!ext.is_paired());
    }

    #[test]
    fn test_send_request_to_unknown_core_fails() {
        let (mut ext, _) = extension(true, MemoryStateStore::default());

        let err = ext.send_request("nobody", "svc/m", None).unwrap_err();

        assert!(matches!(err, ExtensionError::UnknownCore(id) if id == "nobody"));
    }

    #[test]
    fn test_subscription_responses_reach_the_stream() {
        // Arrange
        let (mut ext, _) = extension(true, MemoryStateStore::default());
        let (conn, transport) = register(&mut ext, "A");
        let (_sub, mut stream) = ext
            .subscribe("A", "com.roonlabs.transport:2", "zones", None)
            .unwrap();
        let sent = transport.last_frame().unwrap();

        // Act
        feed(
            &mut ext,
            conn,
            Frame::reply(Verb::Continue, sent.request_id, "Subscribed", Some(json!({"zones": []}).into())),
        );

        // Assert
        match stream.try_next() {
            Some(Response::Continued(reply)) => assert_eq!(reply.name, "Subscribed"),
            other => panic!("expected Continued, got {other:?}"),
        }
    }

    #[test]
    fn test_save_failure_does_not_abort_registration() {
        // Arrange
        let mut store = MockStateStore::new();
        store.expect_load().returning(|| Ok(PersistedState::default()));
        store.expect_save().returning(|_| {
            Err(StoreError::Io {
                path: "/read-only/state.toml".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        });
        let hooks = RecordingHooks::default();
        let mut ext = Extension::new(options(true), Box::new(store), Box::new(hooks.clone())).unwrap();

        // Act
        register(&mut ext, "A");

        // Assert
        assert!(ext.is_paired());
        assert_eq!(hooks.events(), vec!["paired:A"]);
    }
}
