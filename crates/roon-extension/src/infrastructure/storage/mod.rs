//! Storage infrastructure.
//!
//! - **`config`** – the TOML configuration file: extension identity, timers,
//!   and frame logging.
//! - **`state`** – persisted pairing state (paired Core and per-Core tokens)
//!   behind the [`state::StateStore`] seam.

pub mod config;
pub mod state;
