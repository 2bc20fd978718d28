//! Registration handshake payloads.
//!
//! ```text
//! Extension                                   Core
//! ─────────                                   ────
//! REQUEST com.roonlabs.registry:1/info   ──►
//!                                        ◄──  COMPLETE Success {core_id, ...}
//! REQUEST com.roonlabs.registry:1/register {RegistrationInfo}  ──►
//!                                        ◄──  CONTINUE Registered {token, ...}
//! ```
//!
//! The `register` request is never completed by a well-behaved Core; it stays
//! outstanding for the lifetime of the connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata validation failure.
#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    #[error("extension metadata field `{0}` must not be empty")]
    Missing(&'static str),
}

/// How this extension describes itself to a Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub extension_id: String,
    pub display_name: String,
    pub display_version: String,
    pub publisher: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Services the Core must provide for this extension to work.
    #[serde(default)]
    pub required_services: Vec<String>,
    /// Services used when the Core offers them.
    #[serde(default)]
    pub optional_services: Vec<String>,
}

impl ExtensionInfo {
    /// Checks that every mandatory field is filled in.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Missing`] naming the first empty field.
    pub fn validate(&self) -> Result<(), MetadataError> {
        let fields = [
            ("extension_id", &self.extension_id),
            ("display_name", &self.display_name),
            ("display_version", &self.display_version),
            ("publisher", &self.publisher),
            ("email", &self.email),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(MetadataError::Missing(name));
            }
        }
        Ok(())
    }
}

/// Body of the `register` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    #[serde(flatten)]
    pub extension: ExtensionInfo,
    pub provided_services: Vec<String>,
    /// Token handed out by this Core on a previous registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of the `info` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoreInfo {
    pub core_id: String,
    pub display_name: String,
    pub display_version: String,
}

/// Body of the `Registered` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Registered {
    pub core_id: String,
    pub display_name: String,
    pub display_version: String,
    pub token: String,
    #[serde(default)]
    pub provided_services: Vec<String>,
}
