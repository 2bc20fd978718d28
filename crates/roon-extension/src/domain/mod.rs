//! Domain types: who we are (extension metadata) and who we talk to (Cores).
//!
//! Nothing in here performs I/O.  The registration payloads are plain serde
//! structs exchanged as JSON bodies during the `info` / `register` handshake.

pub mod registration;
pub mod remote;

pub use registration::{CoreInfo, ExtensionInfo, MetadataError, Registered, RegistrationInfo};
pub use remote::RemoteCore;
