//! Infrastructure layer: sockets, files, and the task that drives it all.
//!
//! **Dependency rule**: the `domain` layer never imports from here.  The
//! application layer only reaches in for the storage seams (`StateStore`,
//! `FrameLogLevel`); everything that touches the OS stays on this side.

pub mod network;
pub mod runtime;
pub mod storage;
