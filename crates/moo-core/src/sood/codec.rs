//! Binary codec for SOOD discovery datagrams.
//!
//! Wire format:
//! ```text
//! "SOOD" [version:1 = 0x02] [type:1 = 'Q' | 'R'] property*
//! property = [name_len:1][name][value_len:2 BE][value]
//! ```
//! A `value_len` of `0xFFFF` encodes a null value and carries no value bytes.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use super::{CORE_SERVICE_ID, SOOD_MAGIC, SOOD_VERSION};

const NULL_VALUE_LEN: u16 = 0xFFFF;
const HEADER_LEN: usize = SOOD_MAGIC.len() + 2;

/// Errors produced while encoding or decoding a SOOD datagram.
#[derive(Debug, Error, PartialEq)]
pub enum SoodError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("missing SOOD magic")]
    BadMagic,

    #[error("unsupported SOOD version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownKind(u8),

    /// A property declared a zero-length name.
    #[error("zero-length property name at offset {0}")]
    EmptyName(usize),

    /// A property runs past the end of the datagram.
    #[error("property truncated at offset {0}")]
    Truncated(usize),

    #[error("property name longer than 255 bytes: {0:?}")]
    NameTooLong(String),

    #[error("value of property {0:?} longer than 65534 bytes")]
    ValueTooLong(String),
}

/// Datagram type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoodKind {
    Query,
    Reply,
}

impl SoodKind {
    fn as_byte(self) -> u8 {
        match self {
            Self::Query => b'Q',
            Self::Reply => b'R',
        }
    }

    fn from_byte(b: u8) -> Result<Self, SoodError> {
        match b {
            b'Q' => Ok(Self::Query),
            b'R' => Ok(Self::Reply),
            other => Err(SoodError::UnknownKind(other)),
        }
    }
}

/// A parsed SOOD datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct SoodMessage {
    pub kind: SoodKind,
    /// Property values; `None` is the explicit null value.
    pub props: BTreeMap<String, Option<String>>,
}

impl SoodMessage {
    /// Builds a discovery query for `service_id` with a fresh `_tid`.
    pub fn query(service_id: &str) -> Self {
        let mut props = BTreeMap::new();
        props.insert("_tid".to_string(), Some(Uuid::new_v4().to_string()));
        props.insert("query_service_id".to_string(), Some(service_id.to_string()));
        Self {
            kind: SoodKind::Query,
            props,
        }
    }

    /// Returns a non-null property value.
    pub fn prop(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(|v| v.as_deref())
    }
}

/// What a Core says about itself in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub service_id: String,
    pub unique_id: String,
    pub http_port: u16,
    pub tcp_port: Option<u16>,
    pub display_name: Option<String>,
}

impl ServiceAnnouncement {
    /// Extracts a Core announcement from a reply.
    ///
    /// Returns `None` for queries, for other services, and for replies that
    /// lack a `unique_id` or a numeric `http_port`.
    pub fn from_message(msg: &SoodMessage) -> Option<Self> {
        if msg.kind != SoodKind::Reply || msg.prop("service_id") != Some(CORE_SERVICE_ID) {
            return None;
        }
        Some(Self {
            service_id: CORE_SERVICE_ID.to_string(),
            unique_id: msg.prop("unique_id")?.to_string(),
            http_port: msg.prop("http_port")?.parse().ok()?,
            tcp_port: msg.prop("tcp_port").and_then(|p| p.parse().ok()),
            display_name: msg.prop("name").map(str::to_string),
        })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`SoodMessage`] into datagram bytes.
///
/// # Errors
///
/// Returns [`SoodError`] if a property name or value does not fit its length
/// prefix, or a name is empty.
pub fn encode_datagram(msg: &SoodMessage) -> Result<Vec<u8>, SoodError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(SOOD_MAGIC);
    buf.push(SOOD_VERSION);
    buf.push(msg.kind.as_byte());

    for (name, value) in &msg.props {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() {
            return Err(SoodError::EmptyName(buf.len()));
        }
        let name_len =
            u8::try_from(name_bytes.len()).map_err(|_| SoodError::NameTooLong(name.clone()))?;
        buf.push(name_len);
        buf.extend_from_slice(name_bytes);

        match value {
            None => buf.extend_from_slice(&NULL_VALUE_LEN.to_be_bytes()),
            Some(value) => {
                let len = u16::try_from(value.len())
                    .ok()
                    .filter(|&len| len != NULL_VALUE_LEN)
                    .ok_or_else(|| SoodError::ValueTooLong(name.clone()))?;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
        }
    }
    Ok(buf)
}

/// Decodes one SOOD datagram.
///
/// # Errors
///
/// Returns [`SoodError`] for a bad header, a zero-length property name, or a
/// property that runs past the end of the datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<SoodMessage, SoodError> {
    if bytes.len() < HEADER_LEN {
        return Err(SoodError::TooShort(bytes.len()));
    }
    if &bytes[..SOOD_MAGIC.len()] != SOOD_MAGIC {
        return Err(SoodError::BadMagic);
    }
    let version = bytes[SOOD_MAGIC.len()];
    if version != SOOD_VERSION {
        return Err(SoodError::UnsupportedVersion(version));
    }
    let kind = SoodKind::from_byte(bytes[SOOD_MAGIC.len() + 1])?;

    let mut props = BTreeMap::new();
    let mut pos = HEADER_LEN;
    while pos < bytes.len() {
        let start = pos;
        let name_len = bytes[pos] as usize;
        if name_len == 0 {
            return Err(SoodError::EmptyName(start));
        }
        pos += 1;
        let name = take(bytes, pos, name_len, start)?;
        pos += name_len;

        let len_bytes = take(bytes, pos, 2, start)?;
        let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]);
        pos += 2;

        let value = if value_len == NULL_VALUE_LEN {
            None
        } else {
            let raw = take(bytes, pos, value_len as usize, start)?;
            pos += value_len as usize;
            Some(String::from_utf8_lossy(raw).into_owned())
        };
        props.insert(String::from_utf8_lossy(name).into_owned(), value);
    }

    Ok(SoodMessage { kind, props })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn take(buf: &[u8], offset: usize, len: usize, property_start: usize) -> Result<&[u8], SoodError> {
    buf.get(offset..offset + len)
        .ok_or(SoodError::Truncated(property_start))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
