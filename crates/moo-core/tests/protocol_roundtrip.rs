//! Integration tests for the moo-core codecs.
//!
//! These tests drive the public API the way the extension runtime does: a
//! stream of frames with ids drawn from one counter, and SOOD replies built by
//! hand the way a Core would send them.

use moo_core::{
    decode_datagram, decode_frame, encode_datagram, encode_frame,
    protocol::frame::LOGGING_HEADER,
    sood::{CORE_SERVICE_ID, SOOD_MULTICAST_IP, SOOD_PORT},
    Body, Frame, SequenceCounter, ServiceAnnouncement, SoodKind, SoodMessage, Verb,
};
use serde_json::json;

/// Encodes a frame and decodes it again, asserting every byte was consumed.
fn roundtrip(frame: &Frame) -> Frame {
    let bytes = encode_frame(frame).expect("encode must succeed");
    let (decoded, consumed) = decode_frame(&bytes).expect("decode must succeed");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    decoded
}

#[test]
fn test_roundtrip_registration_request() {
    let counter = SequenceCounter::new();
    let original = Frame::request(
        counter.next_id(),
        "com.roonlabs.registry:1",
        "register",
        Some(
            json!({
                "extension_id": "com.example.test",
                "display_name": "Test",
                "required_services": [],
                "optional_services": [],
                "provided_services": ["com.roonlabs.ping:1"],
            })
            .into(),
        ),
    );

    assert_eq!(roundtrip(&original), original);
}

#[test]
fn test_roundtrip_quiet_ping_reply() {
    let original = Frame::reply(Verb::Complete, "41", "Success", None).with_header(LOGGING_HEADER, "quiet");

    let decoded = roundtrip(&original);

    assert!(decoded.is_quiet());
    assert_eq!(decoded, original);
}

#[test]
fn test_roundtrip_binary_body() {
    let original = Frame::reply(
        Verb::Complete,
        "3",
        "Success",
        Some(Body::Raw {
            content_type: "image/jpeg".into(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x0A, b'\n', b'\n'],
        }),
    );

    assert_eq!(roundtrip(&original), original);
}

#[test]
fn test_back_to_back_frames_decode_in_order() {
    // Arrange – three frames concatenated into one buffer
    let counter = SequenceCounter::new();
    let frames: Vec<Frame> = (0..3)
        .map(|i| {
            Frame::reply(
                Verb::Continue,
                counter.next_id(),
                "Changed",
                Some(json!({ "seq": i }).into()),
            )
        })
        .collect();
    let mut buf = Vec::new();
    for f in &frames {
        buf.extend(encode_frame(f).expect("encode must succeed"));
    }

    // Act – decode by advancing a cursor with the consumed count
    let mut decoded = Vec::new();
    let mut cursor = 0;
    while cursor < buf.len() {
        let (frame, consumed) = decode_frame(&buf[cursor..]).expect("decode must succeed");
        decoded.push(frame);
        cursor += consumed;
    }

    // Assert
    assert_eq!(decoded, frames);
    let ids: Vec<&str> = decoded.iter().map(|f| f.request_id.as_str()).collect();
    assert_eq!(ids, ["0", "1", "2"]);
}

#[test]
fn test_sood_reply_from_core_yields_announcement() {
    // Arrange – a reply as a Core would send it
    let mut reply = SoodMessage::query(CORE_SERVICE_ID);
    reply.kind = SoodKind::Reply;
    reply.props.clear();
    for (k, v) in [
        ("service_id", CORE_SERVICE_ID),
        ("unique_id", "b0a7c3d2"),
        ("http_port", "9330"),
        ("name", "Studio"),
    ] {
        reply.props.insert(k.into(), Some(v.into()));
    }
    reply.props.insert("tcp_port".into(), None);

    // Act
    let bytes = encode_datagram(&reply).expect("encode must succeed");
    let decoded = decode_datagram(&bytes).expect("decode must succeed");
    let ann = ServiceAnnouncement::from_message(&decoded).expect("announcement");

    // Assert
    assert_eq!(ann.unique_id, "b0a7c3d2");
    assert_eq!(ann.http_port, 9330);
    assert_eq!(ann.tcp_port, None);
}

#[test]
fn test_sood_constants() {
    assert_eq!(SOOD_PORT, 9003);
    assert!(SOOD_MULTICAST_IP.is_multicast());
    assert_eq!(SOOD_MULTICAST_IP.to_string(), "239.255.90.90");
}
