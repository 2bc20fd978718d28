//! Text codec for MOO/1 frames.
//!
//! Wire format:
//! ```text
//! MOO/1 <VERB> <target>\n
//! Request-Id: <id>\n
//! [Content-Length: <n>\n]
//! [Content-Type: <type>\n]
//! [<Header>: <value>\n]*
//! \n
//! [<n bytes of body>]
//! ```
//! The header block is UTF-8.  The body is parsed as JSON when the content
//! type is `application/json` and kept as raw bytes otherwise.

use std::collections::BTreeMap;

use crate::protocol::frame::{
    Body, Frame, Verb, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE,
    MOO_VERSION, REQUEST_ID_HEADER,
};
use thiserror::Error;

/// Errors that can occur during frame encoding or decoding.
///
/// Every decode error means the peer sent a malformed frame; the connection
/// that produced it cannot be trusted any further.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// No blank line ends the header block.
    #[error("missing blank line after header block")]
    MissingTerminator,

    /// The declared body is longer than the bytes that follow the headers.
    #[error("body truncated: Content-Length is {declared}, only {available} bytes follow")]
    BodyTruncated { declared: usize, available: usize },

    /// The first line is not `MOO/<version> <VERB> <target>`.
    #[error("malformed start line: {0:?}")]
    BadStartLine(String),

    /// The start line names a protocol version other than 1.
    #[error("unsupported MOO version: {0}")]
    UnsupportedVersion(String),

    /// The verb is upper-case but not one of REQUEST, CONTINUE, COMPLETE.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    /// A header line has no `name:` prefix.
    #[error("malformed header line: {0:?}")]
    BadHeader(String),

    /// The frame carries no `Request-Id` header.
    #[error("missing Request-Id header")]
    MissingRequestId,

    /// A non-empty body was declared without a `Content-Type`.
    #[error("Content-Length without Content-Type")]
    MissingContentType,

    /// `Content-Length` is not a non-negative integer.
    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    /// An `application/json` body failed to parse.
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    InvalidUtf8,

    /// A frame field cannot be represented on the wire.
    #[error("cannot encode frame: {0}")]
    InvalidField(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its wire bytes.
///
/// `Content-Length` and `Content-Type` are derived from the body.  An empty
/// raw body is sent as no body at all.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidField`] when a field would break the line
/// structure (embedded newline, `/` in a service name, empty request id, a
/// reserved header name in [`Frame::headers`]) or when a `REQUEST` has no
/// service.
///
/// # Examples
///
/// ```rust
/// use moo_core::protocol::{decode_frame, encode_frame, Frame};
///
/// let frame = Frame::request("0", "com.roonlabs.ping:1", "ping", None);
/// let bytes = encode_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    validate_for_encode(frame)?;

    let body = match &frame.body {
        Some(Body::Json(value)) => Some((
            JSON_CONTENT_TYPE,
            serde_json::to_vec(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?,
        )),
        Some(Body::Raw {
            content_type,
            bytes,
        }) if !bytes.is_empty() => Some((content_type.as_str(), bytes.clone())),
        _ => None,
    };

    let mut head = format!(
        "MOO/{MOO_VERSION} {} {}\n{REQUEST_ID_HEADER}: {}\n",
        frame.verb,
        frame.target(),
        frame.request_id
    );
    if let Some((content_type, bytes)) = &body {
        head.push_str(&format!(
            "{CONTENT_LENGTH_HEADER}: {}\n{CONTENT_TYPE_HEADER}: {content_type}\n",
            bytes.len()
        ));
    }
    for (name, value) in &frame.headers {
        head.push_str(&format!("{name}: {value}\n"));
    }
    head.push('\n');

    let mut buf = head.into_bytes();
    if let Some((_, bytes)) = body {
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed (headers, terminator
/// and declared body).  Bytes after the declared body are left untouched.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are not a well-formed frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let head_len = find_terminator(bytes).ok_or(ProtocolError::MissingTerminator)?;
    let head = std::str::from_utf8(&bytes[..head_len]).map_err(|_| ProtocolError::InvalidUtf8)?;
    let body_start = head_len + 2;

    let mut lines = head.split('\n');
    let start_line = lines.next().unwrap_or_default();
    let (verb, target) = parse_start_line(start_line)?;
    let (service, name) = split_target(verb, target, start_line)?;

    let mut request_id = None;
    let mut content_length = None;
    let mut content_type = None;
    let mut headers = BTreeMap::new();
    for line in lines {
        let (header, value) = parse_header(line)?;
        match header {
            REQUEST_ID_HEADER => request_id = Some(value.to_string()),
            CONTENT_LENGTH_HEADER => {
                let len = value
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
            CONTENT_TYPE_HEADER => content_type = Some(value.to_string()),
            _ => {
                headers.insert(header.to_string(), value.to_string());
            }
        }
    }
    let request_id = request_id.ok_or(ProtocolError::MissingRequestId)?;

    let declared = content_length.unwrap_or(0);
    let body = if declared == 0 {
        None
    } else {
        let content_type = content_type.ok_or(ProtocolError::MissingContentType)?;
        let available = bytes.len() - body_start;
        if available < declared {
            return Err(ProtocolError::BodyTruncated {
                declared,
                available,
            });
        }
        Some(decode_body(
            content_type,
            &bytes[body_start..body_start + declared],
        )?)
    };

    let frame = Frame {
        verb,
        request_id,
        service,
        name,
        headers,
        body,
    };
    Ok((frame, body_start + declared))
}

// ── Decoding helpers ──────────────────────────────────────────────────────────

/// Position of the `\n\n` that ends the header block.
fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\n\n")
}

fn parse_start_line(line: &str) -> Result<(Verb, &str), ProtocolError> {
    let bad = || ProtocolError::BadStartLine(line.to_string());

    let rest = line.strip_prefix("MOO/").ok_or_else(bad)?;
    let (version, rest) = rest.split_once(' ').ok_or_else(bad)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let (verb, target) = rest.split_once(' ').ok_or_else(bad)?;
    if verb.is_empty() || !verb.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(bad());
    }
    if version != MOO_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version.to_string()));
    }
    let verb = Verb::parse(verb).ok_or_else(|| ProtocolError::UnknownVerb(verb.to_string()))?;
    Ok((verb, target))
}

fn split_target(
    verb: Verb,
    target: &str,
    start_line: &str,
) -> Result<(Option<String>, String), ProtocolError> {
    if verb != Verb::Request {
        return Ok((None, target.to_string()));
    }
    match target.split_once('/') {
        Some((service, method)) if !service.is_empty() => {
            Ok((Some(service.to_string()), method.to_string()))
        }
        _ => Err(ProtocolError::BadStartLine(start_line.to_string())),
    }
}

/// Splits `Name: value`, tolerating any number of spaces after the colon.
fn parse_header(line: &str) -> Result<(&str, &str), ProtocolError> {
    match line.split_once(':') {
        Some((name, value)) if !name.is_empty() => Ok((name, value.trim_start_matches(' '))),
        _ => Err(ProtocolError::BadHeader(line.to_string())),
    }
}

fn decode_body(content_type: String, bytes: &[u8]) -> Result<Body, ProtocolError> {
    if content_type == JSON_CONTENT_TYPE {
        let value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Ok(Body::Json(value))
    } else {
        Ok(Body::Raw {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn validate_for_encode(frame: &Frame) -> Result<(), ProtocolError> {
    let invalid = |msg: String| Err(ProtocolError::InvalidField(msg));

    if frame.request_id.is_empty() || has_line_break(&frame.request_id) {
        return invalid(format!("request id {:?}", frame.request_id));
    }
    if has_line_break(&frame.name) {
        return invalid(format!("name {:?}", frame.name));
    }
    match (&frame.service, frame.verb) {
        (Some(service), Verb::Request) => {
            if service.is_empty() || service.contains('/') || has_line_break(service) {
                return invalid(format!("service {service:?}"));
            }
        }
        (None, Verb::Request) => return invalid("REQUEST without a service".to_string()),
        _ => {}
    }
    if let Some(Body::Raw { content_type, .. }) = &frame.body {
        if content_type.is_empty() || has_line_break(content_type) {
            return invalid(format!("content type {content_type:?}"));
        }
    }
    for (name, value) in &frame.headers {
        let reserved = [REQUEST_ID_HEADER, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER]
            .contains(&name.as_str());
        if reserved || name.is_empty() || name.contains(':') || has_line_break(name) {
            return invalid(format!("header name {name:?}"));
        }
        if has_line_break(value) {
            return invalid(format!("header {name} value {value:?}"));
        }
    }
    Ok(())
}

fn has_line_break(s: &str) -> bool {
    s.contains('\n')
}

// ── Tests ─────────────────────────────────────────────────────────────────────
