//! Thread-safe event mailbox.
//!
//! The I/O threads post; embedder threads poll. A poll drains everything
//! queued under the lock, then invokes the handler with no lock held so a
//! handler that calls back into the endpoint cannot deadlock against the
//! reactor.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::metrics::EVENTS_POSTED;
use crate::stream::IncomingStream;

/// Whether an incoming exchange was initiated by the peer or by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer opened the stream; this is a request to answer.
    Request,
    /// We opened the stream; this is the peer's response.
    Response,
}

/// Events delivered to the embedder, in per-connection wire order.
#[derive(Debug)]
pub enum Event {
    /// A peer session is established and authenticated.
    Connect {
        connection_id: u64,
        peer: SocketAddr,
    },
    /// The session is gone. Terminal; at most one per connection.
    Timeout { connection_id: u64 },
    /// A complete request or response arrived on one stream.
    Data {
        connection_id: u64,
        stream: IncomingStream,
        direction: Direction,
    },
}

/// FIFO of [`Event`]s with a condition variable and shutdown flag.
pub struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    cv: Condvar,
    terminated: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            terminated: AtomicBool::new(false),
        }
    }

    /// Enqueue an event and wake one waiter. Never blocks beyond the mutex.
    pub fn post(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
        EVENTS_POSTED.increment();
        self.cv.notify_one();
    }

    /// Drain queued events into `handler`, waiting up to `timeout_ms` for
    /// the first one (negative means wait forever).
    ///
    /// Returns without invoking the handler when the mailbox is shut down or
    /// the wait expires with nothing queued. Events are presented in post
    /// order, with no internal lock held during the handler calls.
    pub fn poll(&self, mut handler: impl FnMut(Event), timeout_ms: i32) {
        let mut drained: Vec<Event> = Vec::new();

        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

            if timeout_ms < 0 {
                while queue.is_empty() && !self.is_terminated() {
                    queue = self.cv.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
            } else {
                let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
                while queue.is_empty() && !self.is_terminated() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .cv
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    queue = guard;
                }
            }

            if self.is_terminated() || queue.is_empty() {
                return;
            }
            drained.extend(queue.drain(..));
        }

        for event in drained {
            handler(event);
        }
    }

    /// Mark the mailbox terminated and wake every waiter. Idempotent.
    ///
    /// Later `post` calls still succeed, but their events are never drained.
    pub fn shutdown(&self) {
        let _queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        self.terminated.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn test_event(id: u64) -> Event {
        Event::Timeout { connection_id: id }
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .map(|e| match e {
                Event::Connect { connection_id, .. }
                | Event::Timeout { connection_id }
                | Event::Data { connection_id, .. } => *connection_id,
            })
            .collect()
    }

    #[test]
    fn poll_drains_in_post_order() {
        let mailbox = Mailbox::new();
        for id in 0..5 {
            mailbox.post(test_event(id));
        }

        let mut seen = Vec::new();
        mailbox.poll(|e| seen.push(e), 0);
        assert_eq!(ids(&seen), vec![0, 1, 2, 3, 4]);

        // A second poll finds nothing.
        let mut seen = Vec::new();
        mailbox.poll(|e| seen.push(e), 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn poll_timeout_is_bounded() {
        let mailbox = Mailbox::new();
        let start = Instant::now();
        mailbox.poll(|_| panic!("no events expected"), 100);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "overslept: {elapsed:?}");
    }

    #[test]
    fn shutdown_wakes_blocked_poll() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                let start = Instant::now();
                mailbox.poll(|_| panic!("no events expected"), -1);
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        mailbox.shutdown();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(2), "shutdown did not wake poll");
    }

    #[test]
    fn post_after_shutdown_is_not_drained() {
        let mailbox = Mailbox::new();
        mailbox.shutdown();
        mailbox.post(test_event(1));
        mailbox.poll(|_| panic!("event after shutdown"), 0);
    }

    #[test]
    fn post_wakes_waiting_poll() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                let mut got = 0u32;
                mailbox.poll(|_| got += 1, 1000);
                got
            })
        };

        thread::sleep(Duration::from_millis(50));
        mailbox.post(test_event(7));
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
