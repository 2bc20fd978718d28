//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`transport`** – The WebSocket a Core serves MOO on, split into a
//!   writer task and a reader task.
//!
//! - **`discovery`** – SOOD multicast/broadcast queries and the per-interface
//!   sockets that receive Core announcements.
//!
//! - **`mock`** – An in-memory [`crate::application::connection::Transport`]
//!   for tests.

pub mod discovery;
pub mod mock;
pub mod transport;
