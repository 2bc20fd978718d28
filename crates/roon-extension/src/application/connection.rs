//! Request correlation over one MOO connection.
//!
//! A [`Connection`] wraps a [`Transport`] and:
//!
//! - hands out request ids from a per-connection counter,
//! - remembers which outstanding request each id belongs to,
//! - routes inbound `CONTINUE` / `COMPLETE` frames to the matching
//!   [`ResponseStream`],
//! - drives the `info` → `register` handshake,
//! - and on [`close`](Connection::close) resolves everything still pending
//!   with [`Response::Closed`].
//!
//! The type is deliberately single-threaded: it is owned by the event loop and
//! never locked.

use std::collections::HashMap;
use std::sync::Arc;

use moo_core::{encode_frame, Body, Frame, ProtocolError, SequenceCounter, Verb};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::registry::{ReplySink, ServiceRegistry};
use crate::domain::RemoteCore;
use crate::infrastructure::storage::config::FrameLogLevel;

/// Registry service the handshake talks to.
pub const REGISTRY_SERVICE: &str = "com.roonlabs.registry:1";

/// Process-wide connection id source.
static CONNECTION_IDS: SequenceCounter = SequenceCounter::new();

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure reported by a [`Transport`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Errors returned by [`Connection`] operations.
#[derive(Debug, Error, PartialEq)]
pub enum ConnectionError {
    /// The request name is not `service/method`.
    #[error("request name {0:?} is not of the form service/method")]
    InvalidName(String),

    #[error(transparent)]
    Encode(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection {0} is closed")]
    Closed(u64),
}

// ── Transport seam ────────────────────────────────────────────────────────────

/// A duplex byte channel carrying one encoded frame per message.
///
/// Inbound messages and the close notification are delivered to the event
/// loop by the transport's own task, not through this trait.
pub trait Transport: Send + Sync {
    /// Queues one encoded frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport can no longer send.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Starts closing the transport.  Idempotent.
    fn close(&self);
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// The name and body of a `CONTINUE` or `COMPLETE` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub name: String,
    pub body: Option<Body>,
}

impl Reply {
    pub fn json(&self) -> Option<&Value> {
        self.body.as_ref().and_then(Body::as_json)
    }
}

/// One event on a [`ResponseStream`].
///
/// A stream yields zero or more `Continued`, then exactly one of `Completed`
/// or `Closed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Continued(Reply),
    Completed(Reply),
    Closed,
}

impl Response {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continued(_))
    }
}

/// Replies to one outbound request.
#[derive(Debug)]
pub struct ResponseStream {
    request_id: String,
    rx: mpsc::UnboundedReceiver<Response>,
}

impl ResponseStream {
    fn channel(request_id: String) -> (mpsc::UnboundedSender<Response>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { request_id, rx })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the next response.  Returns `None` once the terminal response
    /// has been taken.
    pub async fn next(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    /// Returns an already-delivered response without waiting.
    pub fn try_next(&mut self) -> Option<Response> {
        self.rx.try_recv().ok()
    }
}

// ── Outbound subscriptions ────────────────────────────────────────────────────

/// Handle for a subscription this extension opened on the Core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    service: String,
    unsubscribe_name: String,
    key: u64,
}

impl Subscription {
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Sends the matching `unsubscribe_<stem>` request.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the request cannot be encoded.
    pub fn unsubscribe(self, conn: &mut Connection) -> Result<ResponseStream, ConnectionError> {
        let name = format!("{}/{}", self.service, self.unsubscribe_name);
        conn.send_request(&name, Some(json!({ "subscription_key": self.key }).into()))
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Which handshake request a reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Info,
    Register,
}

/// What the connection did with one inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// A `REQUEST` for the service registry.
    Request(Frame),
    /// A reply to one of the handshake requests.
    Handshake(HandshakeStep, Response),
    /// Delivered to a [`ResponseStream`].
    Delivered,
    /// A reply for a request id that is not outstanding.
    UnknownRequest(String),
    /// The connection is already closed.
    Ignored,
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum PendingSink {
    Stream(mpsc::UnboundedSender<Response>),
    Handshake(HandshakeStep),
}

struct PendingRequest {
    sink: PendingSink,
    quiet: bool,
}

/// One MOO session.
pub struct Connection {
    id: u64,
    transport: Arc<dyn Transport>,
    request_ids: SequenceCounter,
    subscription_keys: SequenceCounter,
    pending: HashMap<String, PendingRequest>,
    remote: Option<RemoteCore>,
    log_level: FrameLogLevel,
    closed: bool,
}

impl Connection {
    /// Wraps an open transport.  The connection id is unique for the process.
    pub fn open(transport: Arc<dyn Transport>, log_level: FrameLogLevel) -> Self {
        let id = CONNECTION_IDS.next();
        debug!("connection {id} opened");
        Self {
            id,
            transport,
            request_ids: SequenceCounter::new(),
            subscription_keys: SequenceCounter::new(),
            pending: HashMap::new(),
            remote: None,
            log_level,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The registered Core, once the handshake finished.
    pub fn remote(&self) -> Option<&RemoteCore> {
        self.remote.as_ref()
    }

    pub fn set_remote(&mut self, core: RemoteCore) {
        self.remote = Some(core);
    }

    /// Number of requests still waiting for a `COMPLETE`.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends `REQUEST <name>` where `name` is `service/method`.
    ///
    /// If the connection is closed or the transport rejects the frame, the
    /// returned stream yields [`Response::Closed`] straight away.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidName`] or [`ConnectionError::Encode`]
    /// if the request cannot be put on the wire at all.
    pub fn send_request(&mut self, name: &str, body: Option<Body>) -> Result<ResponseStream, ConnectionError> {
        let (service, method) = split_name(name)?;
        let request_id = self.request_ids.next_id();
        let (tx, stream) = ResponseStream::channel(request_id.clone());
        let frame = Frame::request(request_id, service, method, body);
        self.send_tracked(frame, PendingSink::Stream(tx))?;
        Ok(stream)
    }

    /// Opens a subscription: sends `service/subscribe_<stem>` with a fresh
    /// `subscription_key` merged into `args`.
    ///
    /// # Errors
    ///
    /// Same as [`send_request`](Self::send_request).
    pub fn subscribe(
        &mut self,
        service: &str,
        stem: &str,
        args: Option<Value>,
    ) -> Result<(Subscription, ResponseStream), ConnectionError> {
        let key = self.subscription_keys.next();
        let mut body = match args {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("subscription_key".to_string(), json!(key));

        let name = format!("{service}/subscribe_{stem}");
        let stream = self.send_request(&name, Some(Value::Object(body).into()))?;
        let handle = Subscription {
            service: service.to_string(),
            unsubscribe_name: format!("unsubscribe_{stem}"),
            key,
        };
        Ok((handle, stream))
    }

    /// Sends the first handshake request, `registry/info`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the frame cannot be sent.
    pub fn begin_handshake(&mut self) -> Result<(), ConnectionError> {
        let frame = Frame::request(self.request_ids.next_id(), REGISTRY_SERVICE, "info", None);
        self.send_tracked(frame, PendingSink::Handshake(HandshakeStep::Info))
    }

    /// Sends `registry/register` with the registration info.  The request stays
    /// pending for the life of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the frame cannot be sent.
    pub fn send_register(&mut self, registration: Value) -> Result<(), ConnectionError> {
        let frame = Frame::request(
            self.request_ids.next_id(),
            REGISTRY_SERVICE,
            "register",
            Some(registration.into()),
        );
        self.send_tracked(frame, PendingSink::Handshake(HandshakeStep::Register))
    }

    /// Builds the sink replies to an inbound request are sent through.
    pub fn reply_sink(&self, request: &Frame) -> Arc<dyn ReplySink> {
        Arc::new(MooReply {
            transport: Arc::clone(&self.transport),
            connection_id: self.id,
            request_id: request.request_id.clone(),
            log: self.log_level.allows(request.is_quiet()),
        })
    }

    /// Routes one decoded inbound frame.
    pub fn dispatch_inbound(&mut self, frame: Frame) -> Inbound {
        if self.closed {
            return Inbound::Ignored;
        }
        if frame.verb == Verb::Request {
            if self.log_level.allows(frame.is_quiet()) {
                info!("<- [{}] {frame}", self.id);
            }
            return Inbound::Request(frame);
        }

        let terminal = frame.verb == Verb::Complete;
        let pending = if terminal {
            self.pending.remove(&frame.request_id)
        } else {
            self.pending.get(&frame.request_id).map(|p| PendingRequest {
                sink: p.sink.clone(),
                quiet: p.quiet,
            })
        };
        let Some(pending) = pending else {
            warn!(
                "connection {}: {} for unknown request id {}",
                self.id, frame.verb, frame.request_id
            );
            return Inbound::UnknownRequest(frame.request_id);
        };
        if self.log_level.allows(pending.quiet) {
            info!("<- [{}] {frame}", self.id);
        }

        let reply = Reply {
            name: frame.name,
            body: frame.body,
        };
        let response = if terminal {
            Response::Completed(reply)
        } else {
            Response::Continued(reply)
        };
        match pending.sink {
            PendingSink::Stream(tx) => {
                // The caller may have dropped the stream; that is not an error.
                let _ = tx.send(response);
                Inbound::Delivered
            }
            PendingSink::Handshake(step) => Inbound::Handshake(step, response),
        }
    }

    /// Tears the connection down.
    ///
    /// Resolves every pending request with [`Response::Closed`], closes the
    /// transport, and retires this connection's subscriptions in `registry`
    /// before returning.  Returns `false` if the connection was already closed.
    pub fn close<C>(&mut self, registry: &mut ServiceRegistry<C>, ctx: &mut C) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        for (_, pending) in self.pending.drain() {
            if let PendingSink::Stream(tx) = pending.sink {
                let _ = tx.send(Response::Closed);
            }
        }
        self.transport.close();
        let retired = registry.notify_connection_closed(ctx, self.id);
        debug!("connection {} closed, {retired} subscriptions retired", self.id);
        true
    }

    fn send_tracked(&mut self, frame: Frame, sink: PendingSink) -> Result<(), ConnectionError> {
        let bytes = encode_frame(&frame)?;
        let quiet = frame.is_quiet();

        let result = if self.closed {
            Err(ConnectionError::Closed(self.id))
        } else {
            self.transport.send(bytes).map_err(ConnectionError::from)
        };
        match (result, sink) {
            (Ok(()), sink) => {
                if self.log_level.allows(quiet) {
                    info!("-> [{}] {frame}", self.id);
                }
                self.pending
                    .insert(frame.request_id, PendingRequest { sink, quiet });
                Ok(())
            }
            (Err(e), PendingSink::Stream(tx)) => {
                debug!("connection {}: {frame} not sent: {e}", self.id);
                let _ = tx.send(Response::Closed);
                Ok(())
            }
            (Err(e), PendingSink::Handshake(_)) => Err(e),
        }
    }
}

fn split_name(name: &str) -> Result<(&str, &str), ConnectionError> {
    match name.split_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => Ok((service, method)),
        _ => Err(ConnectionError::InvalidName(name.to_string())),
    }
}

// ── Reply sink ────────────────────────────────────────────────────────────────

/// Sends replies to one inbound request over the connection's transport.
struct MooReply {
    transport: Arc<dyn Transport>,
    connection_id: u64,
    request_id: String,
    log: bool,
}

impl ReplySink for MooReply {
    fn send(&self, verb: Verb, name: &str, body: Option<Body>) -> Result<(), ConnectionError> {
        let frame = Frame::reply(verb, self.request_id.clone(), name, body);
        let bytes = encode_frame(&frame)?;
        self.transport.send(bytes)?;
        if self.log {
            info!("-> [{}] {frame}", self.connection_id);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::{ServiceSpec, SubscriptionSpec};
    use crate::infrastructure::network::mock::MockTransport;
    use moo_core::decode_frame;

    fn open() -> (Connection, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let conn = Connection::open(transport.clone(), FrameLogLevel::Normal);
        (conn, transport)
    }

    fn complete(request_id: &str, name: &str, body: Option<Value>) -> Frame {
        Frame::reply(Verb::Complete, request_id, name, body.map(Body::Json))
    }

    #[test]
    fn test_connection_ids_increase() {
        let (a, _) = open();
        let (b, _) = open();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_request_ids_count_up_from_zero() {
        // Arrange
        let (mut conn, transport) = open();

        // Act
        let ids: Vec<String> = (0..5)
            .map(|_| conn.send_request("svc:1/m", None).unwrap().request_id().to_string())
            .collect();

        // Assert
        assert_eq!(ids, ["0", "1", "2", "3", "4"]);
        assert_eq!(transport.sent_frames().len(), 5);
        assert_eq!(conn.pending_count(), 5);
    }

    #[test]
    fn test_send_request_rejects_name_without_method() {
        let (mut conn, _) = open();
        assert_eq!(
            conn.send_request("justaname", None).unwrap_err(),
            ConnectionError::InvalidName("justaname".into())
        );
    }

    #[test]
    fn test_continue_then_complete_are_delivered_in_order() {
        // Arrange
        let (mut conn, _) = open();
        let mut stream = conn.send_request("svc:1/m", None).unwrap();
        let id = stream.request_id().to_string();

        // Act
        let a = conn.dispatch_inbound(Frame::reply(Verb::Continue, id.clone(), "Subscribed", None));
        let b = conn.dispatch_inbound(complete(&id, "Success", Some(json!({"x": 1}))));

        // Assert
        assert_eq!(a, Inbound::Delivered);
        assert_eq!(b, Inbound::Delivered);
        assert!(matches!(stream.try_next(), Some(Response::Continued(r)) if r.name == "Subscribed"));
        match stream.try_next() {
            Some(Response::Completed(r)) => assert_eq!(r.json(), Some(&json!({"x": 1}))),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_reply_for_unknown_id_is_reported_not_delivered() {
        let (mut conn, _) = open();
        let mut stream = conn.send_request("svc:1/m", None).unwrap();

        let result = conn.dispatch_inbound(complete("99", "Success", None));

        assert_eq!(result, Inbound::UnknownRequest("99".into()));
        assert!(stream.try_next().is_none());
        assert_eq!(conn.pending_count(), 1);
    }

    #[test]
    fn test_complete_removes_pending_so_second_complete_is_unknown() {
        let (mut conn, _) = open();
        let stream = conn.send_request("svc:1/m", None).unwrap();
        let id = stream.request_id().to_string();

        conn.dispatch_inbound(complete(&id, "Success", None));
        let second = conn.dispatch_inbound(complete(&id, "Success", None));

        assert_eq!(second, Inbound::UnknownRequest(id));
    }

    #[test]
    fn test_inbound_request_is_handed_back() {
        let (mut conn, _) = open();
        let frame = Frame::request("5", "com.roonlabs.ping:1", "ping", None);

        assert_eq!(conn.dispatch_inbound(frame.clone()), Inbound::Request(frame));
    }

    #[test]
    fn test_close_resolves_every_pending_request_once() {
        // Arrange
        let (mut conn, transport) = open();
        let mut streams: Vec<ResponseStream> =
            (0..3).map(|_| conn.send_request("svc:1/m", None).unwrap()).collect();
        let mut registry: ServiceRegistry<()> = ServiceRegistry::new();

        // Act
        let first = conn.close(&mut registry, &mut ());
        let second = conn.close(&mut registry, &mut ());

        // Assert
        assert!(first);
        assert!(!second);
        assert!(transport.is_closed());
        for stream in &mut streams {
            assert_eq!(stream.try_next(), Some(Response::Closed));
            assert_eq!(stream.try_next(), None);
        }
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_close_retires_connection_subscriptions_in_registry() {
        // Arrange
        let (mut conn, _) = open();
        let mut registry: ServiceRegistry<Vec<u64>> = ServiceRegistry::new();
        registry
            .register_service(ServiceSpec::new("svc").subscription(
                SubscriptionSpec::new("subscribe_x", "unsubscribe_x", |_: &mut Vec<u64>, _, _| Ok(()))
                    .on_end(|ended: &mut Vec<u64>, end| ended.push(end.connection_id)),
            ))
            .unwrap();
        let mut ended = Vec::new();
        let frame = Frame::request("0", "svc", "subscribe_x", Some(json!({"subscription_key": 1}).into()));
        let request = crate::application::registry::Request::new(conn.id(), frame.clone(), conn.reply_sink(&frame));
        registry.dispatch(&mut ended, request);

        // Act
        conn.close(&mut registry, &mut ended);

        // Assert
        assert_eq!(ended, vec![conn.id()]);
        assert_eq!(registry.subscriptions("svc").unwrap().count("subscribe_x"), 0);
    }

    #[test]
    fn test_frames_after_close_are_ignored() {
        let (mut conn, _) = open();
        let mut registry: ServiceRegistry<()> = ServiceRegistry::new();
        conn.close(&mut registry, &mut ());

        let result = conn.dispatch_inbound(Frame::request("1", "svc", "m", None));

        assert_eq!(result, Inbound::Ignored);
    }

    #[test]
    fn test_send_after_close_yields_closed_immediately() {
        let (mut conn, transport) = open();
        let mut registry: ServiceRegistry<()> = ServiceRegistry::new();
        conn.close(&mut registry, &mut ());

        let mut stream = conn.send_request("svc:1/m", None).unwrap();

        assert_eq!(stream.try_next(), Some(Response::Closed));
        assert!(transport.sent_frames().is_empty());
    }

    #[test]
    fn test_transport_failure_surfaces_as_closed_response() {
        let (mut conn, transport) = open();
        transport.fail_sends();

        let mut stream = conn.send_request("svc:1/m", None).unwrap();

        assert_eq!(stream.try_next(), Some(Response::Closed));
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_subscribe_uses_own_key_counter_and_unsubscribe_mirrors_it() {
        // Arrange
        let (mut conn, transport) = open();
        conn.send_request("svc:1/warmup", None).unwrap();

        // Act
        let (sub, _stream) = conn
            .subscribe("com.roonlabs.transport:2", "zones", Some(json!({"extra": true})))
            .unwrap();
        sub.clone().unsubscribe(&mut conn).unwrap();

        // Assert
        let frames = transport.sent_frames();
        assert_eq!(sub.key(), 0, "subscription keys do not share the request id counter");
        assert_eq!(frames[1].name, "subscribe_zones");
        assert_eq!(frames[1].json(), Some(&json!({"extra": true, "subscription_key": 0})));
        assert_eq!(frames[1].request_id, "1");
        assert_eq!(frames[2].target(), "com.roonlabs.transport:2/unsubscribe_zones");
        assert_eq!(frames[2].json(), Some(&json!({"subscription_key": 0})));
    }

    #[test]
    fn test_handshake_replies_are_surfaced_with_their_step() {
        // Arrange
        let (mut conn, transport) = open();
        conn.begin_handshake().unwrap();
        let info_id = transport.sent_frames()[0].request_id.clone();

        // Act
        let info = conn.dispatch_inbound(complete(&info_id, "Success", Some(json!({"core_id": "c"}))));
        conn.send_register(json!({"extension_id": "x"})).unwrap();
        let reg_id = transport.sent_frames()[1].request_id.clone();
        let registered = conn.dispatch_inbound(Frame::reply(Verb::Continue, reg_id, "Registered", None));

        // Assert
        assert!(matches!(info, Inbound::Handshake(HandshakeStep::Info, Response::Completed(_))));
        assert!(matches!(
            registered,
            Inbound::Handshake(HandshakeStep::Register, Response::Continued(_))
        ));
        assert_eq!(conn.pending_count(), 1, "register stays pending");
        assert_eq!(transport.sent_frames()[0].target(), "com.roonlabs.registry:1/info");
    }

    #[test]
    fn test_reply_sink_answers_with_request_id() {
        let (conn, transport) = open();
        let request = Frame::request("42", "com.roonlabs.ping:1", "ping", None);

        conn.reply_sink(&request).send(Verb::Complete, "Success", None).unwrap();

        let raw = transport.sent().pop().unwrap();
        let (frame, _) = decode_frame(&raw).unwrap();
        assert_eq!(frame, Frame::reply(Verb::Complete, "42", "Success", None));
    }
}
