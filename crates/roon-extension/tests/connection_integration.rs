//! End-to-end tests: the extension runtime against a scripted Core over a real
//! WebSocket on localhost.
//!
//! # What is being exercised?
//!
//! ```text
//! ExtensionHandle ──► event loop ──► WsTransport ──► ws://127.0.0.1:<port>/api
//!                                                          │
//!                                                    FakeCore (this file)
//! ```
//!
//! The fake Core plays the Core's side of the handshake by hand: it answers
//! `registry/info` and `registry/register`, then calls the extension's ping
//! service and answers an outbound request.  Discovery is disabled; the
//! extension connects with [`ExtensionHandle::connect`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use moo_core::{decode_frame, encode_frame, Frame, Verb};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use roon_extension::application::connection::Response;
use roon_extension::application::extension::{Extension, ExtensionOptions};
use roon_extension::infrastructure::runtime::{
    ChannelHooks, CoreEvent, ExtensionHandle, ExtensionRuntime, RuntimeOptions,
};
use roon_extension::infrastructure::storage::config::ExtensionConfig;
use roon_extension::infrastructure::storage::state::MemoryStateStore;

const STEP: Duration = Duration::from_secs(5);

// ── Fake Core ─────────────────────────────────────────────────────────────────

struct FakeCore {
    ws: WebSocketStream<TcpStream>,
}

impl FakeCore {
    async fn recv_frame(&mut self) -> Frame {
        loop {
            let message = timeout(STEP, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            let bytes = match message {
                Message::Binary(bytes) => bytes,
                Message::Text(text) => text.into_bytes(),
                _ => continue,
            };
            return decode_frame(&bytes).expect("extension sent a bad frame").0;
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        let bytes = encode_frame(&frame).expect("encode");
        self.ws.send(Message::Binary(bytes)).await.expect("send");
    }

    /// Answers `info` and `register` as `core_id`.
    async fn register(&mut self, core_id: &str) -> Frame {
        let info = self.recv_frame().await;
        assert_eq!(info.target(), "com.roonlabs.registry:1/info");
        self.send_frame(Frame::reply(
            Verb::Complete,
            info.request_id,
            "Success",
            Some(json!({"core_id": core_id, "display_name": "Test Core", "display_version": "2.0"}).into()),
        ))
        .await;

        let register = self.recv_frame().await;
        assert_eq!(register.target(), "com.roonlabs.registry:1/register");
        self.send_frame(Frame::reply(
            Verb::Continue,
            register.request_id.clone(),
            "Registered",
            Some(
                json!({
                    "core_id": core_id,
                    "display_name": "Test Core",
                    "display_version": "2.0",
                    "token": "tok-1",
                })
                .into(),
            ),
        ))
        .await;
        register
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn start() -> (ExtensionHandle, mpsc::UnboundedReceiver<CoreEvent>) {
    let (hooks, events) = ChannelHooks::new();
    let extension = Extension::new(
        ExtensionOptions::from_config(&ExtensionConfig::default()),
        Box::new(MemoryStateStore::default()),
        Box::new(hooks),
    )
    .expect("extension");
    let options = RuntimeOptions {
        heartbeat_interval: Duration::from_secs(60),
        discovery: None,
    };
    let (handle, _task) = ExtensionRuntime::start(extension, options).expect("runtime");
    (handle, events)
}

/// Has the extension connect to a fresh listener and returns the Core side.
async fn connect(handle: &ExtensionHandle) -> FakeCore {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let client = handle.clone();
    let connecting = tokio::spawn(async move { client.connect("127.0.0.1", port).await });

    let (tcp, _) = timeout(STEP, listener.accept()).await.expect("accept timeout").expect("accept");
    let ws = accept_async(tcp).await.expect("upgrade");
    connecting.await.expect("join").expect("connect");
    FakeCore { ws }
}

/// Waits for the loop to publish the expected paired flag.
async fn paired_becomes(handle: &ExtensionHandle, expected: bool) -> bool {
    for _ in 0..100 {
        if handle.is_paired() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<CoreEvent>) -> CoreEvent {
    timeout(STEP, events.recv())
        .await
        .expect("timed out waiting for a core event")
        .expect("event channel closed")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_over_websocket_pairs_with_core() {
    // Arrange
    let (handle, mut events) = start();
    let mut core = connect(&handle).await;

    // Act
    let register = core.register("core-1").await;

    // Assert
    let body = register.json().expect("register body");
    assert_eq!(body["extension_id"], "org.example.roon-extension");
    assert!(body.get("token").is_none());
    match next_event(&mut events).await {
        CoreEvent::Paired(remote) => assert_eq!(remote.core_id, "core-1"),
        other => panic!("expected Paired, got {other:?}"),
    }
    assert!(paired_becomes(&handle, true).await);
}

#[tokio::test]
async fn test_core_can_ping_the_extension() {
    let (handle, mut events) = start();
    let mut core = connect(&handle).await;
    core.register("core-1").await;
    next_event(&mut events).await;

    core.send_frame(Frame::request("77", "com.roonlabs.ping:1", "ping", None))
        .await;
    let reply = core.recv_frame().await;

    assert_eq!(reply.verb, Verb::Complete);
    assert_eq!(reply.request_id, "77");
    assert_eq!(reply.name, "Success");
}

#[tokio::test]
async fn test_outbound_request_is_answered_through_the_stream() {
    // Arrange
    let (handle, mut events) = start();
    let mut core = connect(&handle).await;
    core.register("core-1").await;
    next_event(&mut events).await;

    // Act
    let mut stream = handle
        .request("core-1", "com.roonlabs.transport:2/get_zones", None)
        .await
        .expect("request");
    let sent = core.recv_frame().await;
    core.send_frame(Frame::reply(
        Verb::Complete,
        sent.request_id.clone(),
        "Success",
        Some(json!({"zones": []}).into()),
    ))
    .await;
    let response = timeout(STEP, stream.next()).await.expect("response timeout");

    // Assert
    assert_eq!(sent.target(), "com.roonlabs.transport:2/get_zones");
    match response {
        Some(Response::Completed(reply)) => {
            assert_eq!(reply.name, "Success");
            assert_eq!(reply.json(), Some(&json!({"zones": []})));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_core_disconnect_unpairs_and_fails_pending_requests() {
    // Arrange
    let (handle, mut events) = start();
    let mut core = connect(&handle).await;
    core.register("core-1").await;
    next_event(&mut events).await;
    let mut stream = handle
        .request("core-1", "com.roonlabs.transport:2/get_zones", None)
        .await
        .expect("request");
    core.recv_frame().await;

    // Act
    drop(core);

    // Assert
    match next_event(&mut events).await {
        CoreEvent::Unpaired(remote) => assert_eq!(remote.core_id, "core-1"),
        other => panic!("expected Unpaired, got {other:?}"),
    }
    let response = timeout(STEP, stream.next()).await.expect("response timeout");
    assert_eq!(response, Some(Response::Closed));
    assert!(paired_becomes(&handle, false).await);
}

#[tokio::test]
async fn test_connect_to_nothing_reports_an_error() {
    let (handle, _events) = start();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let result = handle.connect("127.0.0.1", port).await;

    assert!(result.is_err());
}
