//! Application layer: the protocol state of an extension.
//!
//! Nothing in here performs I/O directly.  Bytes leave through the
//! [`connection::Transport`] seam and persisted state through
//! [`crate::infrastructure::storage::state::StateStore`], so the whole layer
//! runs under unit tests with in-memory doubles.
//!
//! # Sub-modules
//!
//! - **`connection`** – Request correlation for one MOO session: request ids,
//!   pending replies, the `info` → `register` handshake, teardown.
//!
//! - **`registry`** – Services this extension provides, method dispatch, and
//!   the subscription bookkeeping behind `subscribe_*` / `unsubscribe_*`.
//!
//! - **`pairing`** – Which Core the extension is paired with.
//!
//! - **`extension`** – Ties the above together per Core connection and hosts
//!   the built-in ping and pairing services.

pub mod connection;
pub mod extension;
pub mod pairing;
pub mod registry;
