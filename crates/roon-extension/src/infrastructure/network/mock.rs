//! Mock transport for unit and integration testing.
//!
//! Records every frame the extension sends so tests can assert on the wire
//! traffic without a WebSocket peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use moo_core::{decode_frame, Frame};

use crate::application::connection::{Transport, TransportError};

/// A [`Transport`] that stores sent bytes in memory.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of every sent message, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    /// Every sent message decoded as a MOO frame.
    ///
    /// Panics if the extension put something on the wire that does not decode.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent()
            .iter()
            .map(|bytes| decode_frame(bytes).expect("sent bytes must be a valid frame").0)
            .collect()
    }

    /// The most recently sent frame.
    pub fn last_frame(&self) -> Option<Frame> {
        self.sent_frames().pop()
    }

    /// Forgets everything sent so far.
    pub fn clear(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }

    /// Makes every later `send` fail as if the socket had dropped.
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().expect("lock poisoned").push(bytes);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
