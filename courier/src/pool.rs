//! Free-list of fixed-size datagram send buffers.
//!
//! Buffers travel from the pool to the transport's send path and back once
//! the datagram is on the wire. The atomic count lets `acquire` skip the
//! lock entirely while the pool is empty (the common case at startup and
//! under sustained load, where buffers are in flight).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::MAX_DATAGRAM_SEND_SIZE;

/// One UDP datagram's worth of outgoing payload.
pub struct SendBuffer {
    payload: [u8; MAX_DATAGRAM_SEND_SIZE],
    len: usize,
}

impl SendBuffer {
    fn new() -> Box<SendBuffer> {
        Box::new(SendBuffer {
            payload: [0u8; MAX_DATAGRAM_SEND_SIZE],
            len: 0,
        })
    }

    /// The full writable payload area.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Record how many payload bytes are valid.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_DATAGRAM_SEND_SIZE);
        self.len = len;
    }

    /// The valid portion of the payload.
    pub fn filled(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// Number of valid payload bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no payload bytes are valid.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A mutex-guarded free list of [`SendBuffer`]s with an atomic size hint.
pub struct SendBufferPool {
    free: Mutex<Vec<Box<SendBuffer>>>,
    count: AtomicUsize,
}

impl SendBufferPool {
    pub fn new() -> Self {
        SendBufferPool {
            free: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Pop a buffer from the free list, or allocate a fresh one.
    ///
    /// The returned buffer has undefined payload and length zero.
    pub fn acquire(&self) -> Box<SendBuffer> {
        if self.count.load(Ordering::Relaxed) > 0 {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(mut buf) = free.pop() {
                self.count.fetch_sub(1, Ordering::Relaxed);
                buf.len = 0;
                return buf;
            }
        }

        SendBuffer::new()
    }

    /// Return a buffer to the free list.
    pub fn release(&self, buf: Box<SendBuffer>) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(buf);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for SendBufferPool {
    fn default() -> Self {
        SendBufferPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_starts_empty() {
        let pool = SendBufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn release_then_acquire_reuses() {
        let pool = SendBufferPool::new();
        let mut buf = pool.acquire();
        buf.set_len(100);
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert_eq!(pool.idle(), 0);
        // Length is reset even though the buffer came off the free list.
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn filled_tracks_set_len() {
        let pool = SendBufferPool::new();
        let mut buf = pool.acquire();
        buf.payload_mut()[..3].copy_from_slice(&[1, 2, 3]);
        buf.set_len(3);
        assert_eq!(buf.filled(), &[1, 2, 3]);
    }
}
