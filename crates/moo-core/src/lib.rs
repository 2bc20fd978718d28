//! # moo-core
//!
//! Wire formats shared by the Roon extension client:
//!
//! - **`protocol`** – MOO/1, the line-and-length-delimited request/response
//!   protocol spoken over the WebSocket connection to a Core.  Frames carry a
//!   verb (`REQUEST`, `CONTINUE`, `COMPLETE`), a `Request-Id` that correlates
//!   replies with requests, free-form headers and an optional JSON or binary
//!   body.
//!
//! - **`sood`** – the UDP discovery datagram format.  Queries go out to a
//!   multicast group and the broadcast address of every interface; Cores reply
//!   with how to reach them.
//!
//! The crate is pure: no sockets, no clocks, no global state beyond what a
//! caller puts in a `static` [`SequenceCounter`].

pub mod protocol;
pub mod sood;

pub use protocol::{decode_frame, encode_frame, Body, Frame, ProtocolError, SequenceCounter, Verb};
pub use sood::{decode_datagram, encode_datagram, ServiceAnnouncement, SoodError, SoodKind, SoodMessage};
