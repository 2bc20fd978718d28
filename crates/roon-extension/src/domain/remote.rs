//! A registered remote Core.

use std::fmt;

/// A Core that completed registration on one connection.
///
/// The value lives as long as that connection; a Core that reconnects gets a
/// new `RemoteCore` with a new `connection_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCore {
    pub core_id: String,
    pub display_name: String,
    pub display_version: String,
    pub connection_id: u64,
    /// Services the Core granted at registration, e.g.
    /// `com.roonlabs.transport:2`.
    pub provided_services: Vec<String>,
}

impl RemoteCore {
    /// Whether the Core granted `service`.
    pub fn provides(&self, service: &str) -> bool {
        self.provided_services.iter().any(|s| s == service)
    }
}

impl fmt::Display for RemoteCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, connection {})",
            self.core_id, self.display_name, self.display_version, self.connection_id
        )
    }
}
