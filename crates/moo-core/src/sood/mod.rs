//! SOOD: the UDP discovery protocol Roon Cores answer on.
//!
//! A client multicasts (and broadcasts) a query naming the service it wants;
//! every Core on the LAN replies with its `unique_id` and the port its
//! WebSocket endpoint listens on.

pub mod codec;

pub use codec::{
    decode_datagram, encode_datagram, ServiceAnnouncement, SoodError, SoodKind, SoodMessage,
};

/// UDP port queries are sent to and Cores listen on.
pub const SOOD_PORT: u16 = 9003;

/// Multicast group queries are sent to.
pub const SOOD_MULTICAST_IP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 255, 90, 90);

/// Service id a Roon Core answers to.
pub const CORE_SERVICE_ID: &str = "00720724-5143-4a9b-abac-0e50cba674bb";

pub(crate) const SOOD_MAGIC: &[u8] = b"SOOD";
pub(crate) const SOOD_VERSION: u8 = 2;
