//! The 256-byte input ring buffering inbound payload bytes between frame
//! delivery and the client's own `recv` calls. A wrap that would overtake
//! the read cursor marks the whole transport unusable rather than silently
//! overwriting unread data.
//!
//! `arraydeque`'s `Saturating` behavior fails a `push_back` on a full deque
//! instead of overwriting the oldest byte, which is exactly that invariant.

use arraydeque::{behavior::Saturating, ArrayDeque};

use crate::error::Error;

pub struct InputRing {
    buf: ArrayDeque<[u8; 256], Saturating>,
}

impl InputRing {
    pub fn new() -> InputRing {
        InputRing {
            buf: ArrayDeque::new(),
        }
    }

    /// Append one byte. `Err(Error::BufferOverrun)` if the ring is full —
    /// this should never happen since the stop-and-wait protocol never has
    /// more than one chunk in flight, so a caller hitting this should latch
    /// `transport_unusable`.
    pub fn push(&mut self, byte: u8) -> Result<(), Error> {
        self.buf.push_back(byte).map_err(|_| Error::BufferOverrun)
    }

    pub fn push_slice(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &b in bytes {
            self.push(b)?;
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard everything currently buffered, e.g. for the session's
    /// `drain()` operation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for InputRing {
    fn default() -> Self {
        InputRing::new()
    }
}
