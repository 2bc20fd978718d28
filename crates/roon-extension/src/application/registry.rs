//! Service registration and inbound request dispatch.
//!
//! A Core calls into the extension with `REQUEST <service>/<method>` frames.
//! The [`ServiceRegistry`] maps those names onto handlers and keeps the
//! bookkeeping for long-lived subscriptions: every accepted
//! `subscribe_<x>` request is remembered, keyed by connection and
//! `subscription_key`, so the service can later push `CONTINUE` frames to all
//! subscribers or end them.
//!
//! # Subscription lifecycle
//!
//! ```text
//! REQUEST svc/subscribe_x {subscription_key: 7}
//!   └─ recorded ─► on_start() ── Ok ──► stays open
//!                             └─ Err ─► entry dropped, COMPLETE <rejection>
//! REQUEST svc/unsubscribe_x {subscription_key: 7}
//!   └─ entry removed ─► on_end(Unsubscribed) ─► COMPLETE Unsubscribed
//! connection closes
//!   └─ every entry of that connection removed ─► on_end(ConnectionClosed)
//! ```
//!
//! Completing a subscription always retires the entry first and sends the
//! `COMPLETE` afterwards, so no `CONTINUE` can follow it.  This also holds for
//! a `COMPLETE` sent through the subscribe request itself, from inside
//! `on_start` or later through [`Request::reply_sink`]: that sink marks the
//! entry retired before forwarding.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use moo_core::{Body, Frame, Verb};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::connection::ConnectionError;

/// Name of the reply sent for requests the registry cannot route.
pub const INVALID_REQUEST: &str = "InvalidRequest";

/// Errors raised while registering services.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("service {0} is already registered")]
    DuplicateService(String),

    #[error("service {service} declares method {method} twice")]
    DuplicateMethod { service: String, method: String },
}

// ── Reply plumbing ────────────────────────────────────────────────────────────

/// Where replies to one inbound request go.
///
/// Implemented by the connection layer; tests substitute a recorder.
pub trait ReplySink: Send + Sync {
    /// Sends a `CONTINUE` or `COMPLETE` reply.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the reply cannot be encoded or the
    /// transport is gone.
    fn send(&self, verb: Verb, name: &str, body: Option<Body>) -> Result<(), ConnectionError>;
}

/// An inbound `REQUEST` together with the means to answer it.
pub struct Request {
    pub connection_id: u64,
    pub frame: Frame,
    reply: Arc<dyn ReplySink>,
}

impl Request {
    pub fn new(connection_id: u64, frame: Frame, reply: Arc<dyn ReplySink>) -> Self {
        Self {
            connection_id,
            frame,
            reply,
        }
    }

    pub fn service(&self) -> &str {
        self.frame.service.as_deref().unwrap_or_default()
    }

    pub fn method(&self) -> &str {
        &self.frame.name
    }

    /// The JSON body, if any.
    pub fn body(&self) -> Option<&Value> {
        self.frame.json()
    }

    /// Sends an intermediate reply.  Transport failures are logged; they also
    /// close the connection, which is reported separately.
    pub fn send_continue(&self, name: &str, body: Option<Value>) {
        deliver(self.reply.as_ref(), Verb::Continue, name, body);
    }

    /// Sends the final reply.
    pub fn send_complete(&self, name: &str, body: Option<Value>) {
        deliver(self.reply.as_ref(), Verb::Complete, name, body);
    }

    pub fn reply_sink(&self) -> Arc<dyn ReplySink> {
        Arc::clone(&self.reply)
    }

    fn invalid(&self, error: String) {
        self.send_complete(INVALID_REQUEST, Some(json!({ "error": error })));
    }

    /// Routes every later reply through a sink that sets `retired` before a
    /// `COMPLETE` goes out.
    fn retiring(self, retired: Arc<AtomicBool>) -> Self {
        let Self {
            connection_id,
            frame,
            reply,
        } = self;
        Self {
            connection_id,
            frame,
            reply: Arc::new(RetiringSink { inner: reply, retired }),
        }
    }
}

/// Reply sink of a recorded subscription.
struct RetiringSink {
    inner: Arc<dyn ReplySink>,
    retired: Arc<AtomicBool>,
}

impl ReplySink for RetiringSink {
    fn send(&self, verb: Verb, name: &str, body: Option<Body>) -> Result<(), ConnectionError> {
        if verb == Verb::Complete {
            self.retired.store(true, Ordering::Release);
        } else if self.retired.load(Ordering::Acquire) {
            debug!("subscription already completed, dropping {verb} {name}");
            return Ok(());
        }
        self.inner.send(verb, name, body)
    }
}

fn deliver(sink: &dyn ReplySink, verb: Verb, name: &str, body: Option<Value>) {
    if let Err(e) = sink.send(verb, name, body.map(Body::Json)) {
        debug!("dropping {verb} {name}: {e}");
    }
}

// ── Service definition ────────────────────────────────────────────────────────

/// Handler for a plain method.  Receives the context, the owning service's
/// subscriptions, and the request.
pub type MethodHandler<C> = Box<dyn Fn(&mut C, &mut Subscriptions, Request) + Send>;

/// Called when a subscribe request arrives, after the entry is recorded.
/// Typically sends the initial `CONTINUE Subscribed` state; returning `Err`
/// refuses the subscription.  A `COMPLETE` sent through the request retires
/// the entry, so a hook may also end the subscription straight away.
pub type StartHook<C> =
    Box<dyn Fn(&mut C, &mut Subscriptions, &Request) -> Result<(), Rejection> + Send>;

/// Called once for every subscription that ends without being completed by
/// the service.
pub type EndHook<C> = Box<dyn Fn(&mut C, &SubscriptionEnd) + Send>;

/// A refused subscription: sent back as `COMPLETE <name> <body>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub name: String,
    pub body: Option<Value>,
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Unsubscribed,
    ConnectionClosed,
}

/// Passed to [`EndHook`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEnd {
    pub subscribe_name: String,
    pub connection_id: u64,
    pub key: String,
    pub reason: EndReason,
}

/// One `subscribe_x` / `unsubscribe_x` pair.
pub struct SubscriptionSpec<C> {
    subscribe_name: String,
    unsubscribe_name: String,
    on_start: StartHook<C>,
    on_end: Option<EndHook<C>>,
}

impl<C> SubscriptionSpec<C> {
    pub fn new(
        subscribe_name: impl Into<String>,
        unsubscribe_name: impl Into<String>,
        on_start: impl Fn(&mut C, &mut Subscriptions, &Request) -> Result<(), Rejection>
            + Send
            + 'static,
    ) -> Self {
        Self {
            subscribe_name: subscribe_name.into(),
            unsubscribe_name: unsubscribe_name.into(),
            on_start: Box::new(on_start),
            on_end: None,
        }
    }

    pub fn on_end(mut self, on_end: impl Fn(&mut C, &SubscriptionEnd) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(on_end));
        self
    }
}

/// Everything needed to register one service.
pub struct ServiceSpec<C> {
    name: String,
    methods: Vec<(String, MethodHandler<C>)>,
    subscriptions: Vec<SubscriptionSpec<C>>,
}

impl<C> ServiceSpec<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut C, &mut Subscriptions, Request) + Send + 'static,
    ) -> Self {
        self.methods.push((name.into(), Box::new(handler)));
        self
    }

    pub fn subscription(mut self, spec: SubscriptionSpec<C>) -> Self {
        self.subscriptions.push(spec);
        self
    }
}

// ── Subscription bookkeeping ──────────────────────────────────────────────────

struct ActiveSubscription {
    key: String,
    reply: Arc<dyn ReplySink>,
    retired: Arc<AtomicBool>,
}

impl ActiveSubscription {
    /// `false` once a `COMPLETE` has gone out through the entry's sink.
    fn is_live(&self) -> bool {
        !self.retired.load(Ordering::Acquire)
    }
}

/// Active subscriptions of one service:
/// `subscribe_name → connection_id → subscription_key → entry`.
#[derive(Default)]
pub struct Subscriptions {
    active: HashMap<String, HashMap<u64, HashMap<String, ActiveSubscription>>>,
}

impl Subscriptions {
    /// Number of open subscriptions of one kind across all connections.
    pub fn count(&self, subscribe_name: &str) -> usize {
        self.active
            .get(subscribe_name)
            .map(|by_conn| {
                by_conn
                    .values()
                    .flat_map(HashMap::values)
                    .filter(|entry| entry.is_live())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_active(&self, subscribe_name: &str, connection_id: u64, key: &str) -> bool {
        self.active
            .get(subscribe_name)
            .and_then(|by_conn| by_conn.get(&connection_id))
            .and_then(|by_key| by_key.get(key))
            .is_some_and(ActiveSubscription::is_live)
    }

    /// Sends `CONTINUE <name>` to every subscriber of `subscribe_name`.
    pub fn send_continue_all(&self, subscribe_name: &str, name: &str, body: Option<Value>) {
        let Some(by_conn) = self.active.get(subscribe_name) else {
            return;
        };
        for entry in by_conn.values().flat_map(HashMap::values).filter(|e| e.is_live()) {
            deliver(entry.reply.as_ref(), Verb::Continue, name, body.clone());
        }
    }

    /// Ends every subscription of `subscribe_name` with `COMPLETE <name>`.
    /// Returns how many were ended.
    pub fn send_complete_all(&mut self, subscribe_name: &str, name: &str, body: Option<Value>) -> usize {
        let retired: Vec<ActiveSubscription> = self
            .active
            .remove(subscribe_name)
            .into_iter()
            .flat_map(HashMap::into_values)
            .flat_map(HashMap::into_values)
            .filter(ActiveSubscription::is_live)
            .collect();
        for entry in &retired {
            deliver(entry.reply.as_ref(), Verb::Complete, name, body.clone());
        }
        retired.len()
    }

    /// Ends one subscription with `COMPLETE <name>`.  Returns `false` if it was
    /// not active.
    pub fn complete(
        &mut self,
        subscribe_name: &str,
        connection_id: u64,
        key: &str,
        name: &str,
        body: Option<Value>,
    ) -> bool {
        match self.remove_live(subscribe_name, connection_id, key) {
            Some(entry) => {
                deliver(entry.reply.as_ref(), Verb::Complete, name, body);
                true
            }
            None => false,
        }
    }

    /// Records `entry`, returning the live entry it replaced.  Retired entries
    /// of the same connection are pruned on the way.
    fn insert(&mut self, subscribe_name: &str, connection_id: u64, entry: ActiveSubscription) -> Option<ActiveSubscription> {
        let by_key = self
            .active
            .entry(subscribe_name.to_string())
            .or_default()
            .entry(connection_id)
            .or_default();
        by_key.retain(|_, e| e.is_live());
        by_key.insert(entry.key.clone(), entry)
    }

    fn remove(&mut self, subscribe_name: &str, connection_id: u64, key: &str) -> Option<ActiveSubscription> {
        let by_conn = self.active.get_mut(subscribe_name)?;
        let by_key = by_conn.get_mut(&connection_id)?;
        let entry = by_key.remove(key);
        if by_key.is_empty() {
            by_conn.remove(&connection_id);
        }
        entry
    }

    fn remove_live(&mut self, subscribe_name: &str, connection_id: u64, key: &str) -> Option<ActiveSubscription> {
        self.remove(subscribe_name, connection_id, key)
            .filter(ActiveSubscription::is_live)
    }

    /// Removes every entry of one connection, returning `(subscribe_name, key)`
    /// pairs.
    fn drain_connection(&mut self, connection_id: u64) -> Vec<(String, String)> {
        let mut drained = Vec::new();
        for (subscribe_name, by_conn) in &mut self.active {
            if let Some(by_key) = by_conn.remove(&connection_id) {
                drained.extend(
                    by_key
                        .into_values()
                        .filter(ActiveSubscription::is_live)
                        .map(|entry| (subscribe_name.clone(), entry.key)),
                );
            }
        }
        drained
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

enum Method<C> {
    Plain(MethodHandler<C>),
    Subscribe(String),
    Unsubscribe(String),
}

struct SubscriptionHooks<C> {
    on_start: StartHook<C>,
    on_end: Option<EndHook<C>>,
}

struct Service<C> {
    methods: HashMap<String, Method<C>>,
    hooks: HashMap<String, SubscriptionHooks<C>>,
    subscriptions: Subscriptions,
}

/// The catalogue of services this extension provides.
///
/// `C` is the context handed to every handler; the registry never touches it
/// except to pass it along.
pub struct ServiceRegistry<C> {
    services: BTreeMap<String, Service<C>>,
}

impl<C> Default for ServiceRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ServiceRegistry<C> {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    /// Registers a service, synthesizing the subscribe/unsubscribe methods of
    /// each subscription pair.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the service name is taken or a method name
    /// appears twice.
    pub fn register_service(&mut self, spec: ServiceSpec<C>) -> Result<(), RegistryError> {
        if self.services.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateService(spec.name));
        }

        let mut methods = HashMap::new();
        let mut hooks = HashMap::new();
        let duplicate = |method: &str| RegistryError::DuplicateMethod {
            service: spec.name.clone(),
            method: method.to_string(),
        };

        for (name, handler) in spec.methods {
            if methods.insert(name.clone(), Method::Plain(handler)).is_some() {
                return Err(duplicate(&name));
            }
        }
        for sub in spec.subscriptions {
            let subscribe = Method::Subscribe(sub.subscribe_name.clone());
            if methods.insert(sub.subscribe_name.clone(), subscribe).is_some() {
                return Err(duplicate(&sub.subscribe_name));
            }
            let unsubscribe = Method::Unsubscribe(sub.subscribe_name.clone());
            if methods.insert(sub.unsubscribe_name.clone(), unsubscribe).is_some() {
                return Err(duplicate(&sub.unsubscribe_name));
            }
            hooks.insert(
                sub.subscribe_name,
                SubscriptionHooks {
                    on_start: sub.on_start,
                    on_end: sub.on_end,
                },
            );
        }

        debug!("registered service {}", spec.name);
        self.services.insert(
            spec.name,
            Service {
                methods,
                hooks,
                subscriptions: Subscriptions::default(),
            },
        );
        Ok(())
    }

    /// Names of every registered service, sorted.
    pub fn provided_services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn subscriptions(&self, service: &str) -> Option<&Subscriptions> {
        self.services.get(service).map(|s| &s.subscriptions)
    }

    pub fn subscriptions_mut(&mut self, service: &str) -> Option<&mut Subscriptions> {
        self.services.get_mut(service).map(|s| &mut s.subscriptions)
    }

    /// Routes one inbound request to its handler.
    ///
    /// Unknown services and methods are answered with `COMPLETE InvalidRequest`.
    pub fn dispatch(&mut self, ctx: &mut C, request: Request) {
        let Some(service) = self.services.get_mut(request.service()) else {
            warn!("request for unknown service {}", request.service());
            let error = format!("unknown service: {}", request.service());
            request.invalid(error);
            return;
        };
        let Service {
            methods,
            hooks,
            subscriptions,
        } = service;

        match methods.get(request.method()) {
            None => {
                let error = format!(
                    "unknown request name ({}) : {}",
                    request.service(),
                    request.method()
                );
                request.invalid(error);
            }
            Some(Method::Plain(handler)) => handler(ctx, subscriptions, request),
            Some(Method::Subscribe(subscribe_name)) => {
                let Some(key) = subscription_key(&request) else {
                    request.invalid("missing subscription_key".to_string());
                    return;
                };
                let Some(hook) = hooks.get(subscribe_name) else {
                    return;
                };
                let completed = Arc::new(AtomicBool::new(false));
                let request = request.retiring(Arc::clone(&completed));
                let connection_id = request.connection_id;
                let previous = subscriptions.insert(
                    subscribe_name,
                    connection_id,
                    ActiveSubscription {
                        key: key.clone(),
                        reply: request.reply_sink(),
                        retired: Arc::clone(&completed),
                    },
                );

                match (hook.on_start)(ctx, subscriptions, &request) {
                    // Completed from inside on_start.
                    Ok(()) if completed.load(Ordering::Acquire) => {
                        subscriptions.remove(subscribe_name, connection_id, &key);
                    }
                    Ok(()) => {}
                    Err(rejection) => {
                        subscriptions.remove(subscribe_name, connection_id, &key);
                        if let Some(previous) = previous {
                            subscriptions.insert(subscribe_name, connection_id, previous);
                        }
                        request.send_complete(&rejection.name, rejection.body);
                    }
                }
            }
            Some(Method::Unsubscribe(subscribe_name)) => {
                let Some(key) = subscription_key(&request) else {
                    request.invalid("missing subscription_key".to_string());
                    return;
                };
                if subscriptions
                    .remove_live(subscribe_name, request.connection_id, &key)
                    .is_some()
                {
                    if let Some(on_end) = hooks.get(subscribe_name).and_then(|h| h.on_end.as_ref()) {
                        on_end(
                            ctx,
                            &SubscriptionEnd {
                                subscribe_name: subscribe_name.clone(),
                                connection_id: request.connection_id,
                                key,
                                reason: EndReason::Unsubscribed,
                            },
                        );
                    }
                }
                request.send_complete("Unsubscribed", None);
            }
        }
    }

    /// Retires every subscription held by `connection_id`, calling `on_end`
    /// once per retired entry.  Returns the number of entries retired.
    pub fn notify_connection_closed(&mut self, ctx: &mut C, connection_id: u64) -> usize {
        let mut retired = 0;
        for service in self.services.values_mut() {
            for (subscribe_name, key) in service.subscriptions.drain_connection(connection_id) {
                retired += 1;
                if let Some(on_end) = service.hooks.get(&subscribe_name).and_then(|h| h.on_end.as_ref()) {
                    on_end(
                        ctx,
                        &SubscriptionEnd {
                            subscribe_name,
                            connection_id,
                            key,
                            reason: EndReason::ConnectionClosed,
                        },
                    );
                }
            }
        }
        retired
    }
}

/// Reads `subscription_key` from the body; numbers and strings are accepted.
fn subscription_key(request: &Request) -> Option<String> {
    match request.body()?.get("subscription_key")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
