//! MOO/1 frame types.
//!
//! A [`Frame`] is one complete transmission on a MOO connection: a start line,
//! a header block, and an optional body.  Three verbs exist:
//!
//! - `REQUEST` – asks the peer to run `service/method`.
//! - `CONTINUE` – an intermediate reply; more replies for the same request
//!   will follow (used by subscriptions).
//! - `COMPLETE` – the final reply for a request.
//!
//! The reserved headers `Request-Id`, `Content-Length` and `Content-Type` are
//! modelled as fields of [`Frame`] and never appear in [`Frame::headers`].

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Protocol version carried in every start line (`MOO/1`).
pub const MOO_VERSION: &str = "1";

/// Content type that marks a body as UTF-8 JSON.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header name that carries the request correlation id.
pub const REQUEST_ID_HEADER: &str = "Request-Id";

/// Header name that declares the body length in bytes.
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";

/// Header name that declares the body media type.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Header used by peers to mark chatty requests (heartbeats, polling).
pub const LOGGING_HEADER: &str = "Logging";

/// The three MOO verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Request,
    Continue,
    Complete,
}

impl Verb {
    /// Returns the on-the-wire spelling of this verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Continue => "CONTINUE",
            Self::Complete => "COMPLETE",
        }
    }

    /// Parses the on-the-wire spelling; `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUEST" => Some(Self::Request),
            "CONTINUE" => Some(Self::Continue),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// An `application/json` body.
    Json(Value),
    /// Any other content type, kept as opaque bytes.
    Raw { content_type: String, bytes: Vec<u8> },
}

impl Body {
    /// The `Content-Type` this body is sent with.
    pub fn content_type(&self) -> &str {
        match self {
            Self::Json(_) => JSON_CONTENT_TYPE,
            Self::Raw { content_type, .. } => content_type,
        }
    }

    /// Returns the JSON value for JSON bodies.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Raw { .. } => None,
        }
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// One MOO transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub verb: Verb,
    /// Correlates replies with the request that caused them.
    pub request_id: String,
    /// Target service; only present on `REQUEST` frames.
    pub service: Option<String>,
    /// Method name for requests, result name for replies.
    pub name: String,
    /// Non-reserved headers, keyed by name.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Body>,
}

impl Frame {
    /// Builds a `REQUEST` frame for `service/name`.
    pub fn request(
        request_id: impl Into<String>,
        service: impl Into<String>,
        name: impl Into<String>,
        body: Option<Body>,
    ) -> Self {
        Self {
            verb: Verb::Request,
            request_id: request_id.into(),
            service: Some(service.into()),
            name: name.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Builds a `CONTINUE` or `COMPLETE` reply frame.
    pub fn reply(
        verb: Verb,
        request_id: impl Into<String>,
        name: impl Into<String>,
        body: Option<Body>,
    ) -> Self {
        Self {
            verb,
            request_id: request_id.into(),
            service: None,
            name: name.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Adds a non-reserved header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Looks up a non-reserved header by exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// True when the peer asked for this frame not to be logged.
    pub fn is_quiet(&self) -> bool {
        self.header(LOGGING_HEADER) == Some("quiet")
    }

    /// The JSON body, if there is one.
    pub fn json(&self) -> Option<&Value> {
        self.body.as_ref().and_then(Body::as_json)
    }

    /// The start-line target: `service/name` for requests, `name` otherwise.
    pub fn target(&self) -> String {
        match &self.service {
            Some(service) if self.verb == Verb::Request => format!("{service}/{}", self.name),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.verb, self.target(), self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verb_parse_accepts_only_known_verbs() {
        assert_eq!(Verb::parse("REQUEST"), Some(Verb::Request));
        assert_eq!(Verb::parse("CONTINUE"), Some(Verb::Continue));
        assert_eq!(Verb::parse("COMPLETE"), Some(Verb::Complete));
        assert_eq!(Verb::parse("request"), None);
        assert_eq!(Verb::parse("PUBLISH"), None);
    }

    #[test]
    fn test_request_target_joins_service_and_method() {
        // Arrange
        let frame = Frame::request("3", "com.roonlabs.ping:1", "ping", None);

        // Act / Assert
        assert_eq!(frame.target(), "com.roonlabs.ping:1/ping");
        assert_eq!(frame.to_string(), "REQUEST com.roonlabs.ping:1/ping [3]");
    }

    #[test]
    fn test_reply_target_is_result_name() {
        let frame = Frame::reply(Verb::Complete, "3", "Success", None);

        assert_eq!(frame.target(), "Success");
        assert!(frame.service.is_none());
    }

    #[test]
    fn test_is_quiet_reads_logging_header() {
        let loud = Frame::request("1", "svc", "m", None);
        let quiet = loud.clone().with_header(LOGGING_HEADER, "quiet");
        let other = loud.clone().with_header(LOGGING_HEADER, "verbose");

        assert!(!loud.is_quiet());
        assert!(quiet.is_quiet());
        assert!(!other.is_quiet());
    }

    #[test]
    fn test_json_accessor_ignores_raw_bodies() {
        let json_frame = Frame::reply(Verb::Complete, "1", "Success", Some(json!({"a": 1}).into()));
        let raw_frame = Frame::reply(
            Verb::Complete,
            "1",
            "Success",
            Some(Body::Raw {
                content_type: "image/jpeg".into(),
                bytes: vec![0xFF, 0xD8],
            }),
        );

        assert_eq!(json_frame.json(), Some(&json!({"a": 1})));
        assert_eq!(raw_frame.json(), None);
        assert_eq!(raw_frame.body.as_ref().map(Body::content_type), Some("image/jpeg"));
    }
}
