//! Connection table and pacing thread.
//!
//! Connections are indexed twice: by destination connection id for datagram
//! routing, and by assigned id for embedder operations. The pacing thread
//! wakes every 10/20 ms, reaps timed-out connections, expires deadlines, and
//! drains egress; a tick that produced datagrams schedules the next one at
//! the fast interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::cid::ConnectionId;
use crate::config::{SEND_FAST_INTERVAL, SEND_SLOW_INTERVAL};
use crate::connection::Connection;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED};
use crate::pool::SendBuffer;
use crate::socket::UdpReactor;

struct Tables {
    by_dcid: HashMap<ConnectionId, Arc<Connection>>,
    by_id: HashMap<u64, Arc<Connection>>,
}

/// Shared connection registry driven by the pacing thread.
pub(crate) struct Pacer {
    tables: Mutex<Tables>,
    terminated: AtomicBool,
}

impl Pacer {
    pub fn new() -> Arc<Pacer> {
        Arc::new(Pacer {
            tables: Mutex::new(Tables {
                by_dcid: HashMap::new(),
                by_id: HashMap::new(),
            }),
            terminated: AtomicBool::new(false),
        })
    }

    /// Register a connection under both indexes.
    pub fn insert(&self, dcid: ConnectionId, conn: Arc<Connection>) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.by_id.insert(conn.assigned_id(), conn.clone());
        tables.by_dcid.insert(dcid, conn);
        CONNECTIONS_ACTIVE.increment();
    }

    /// Look up the routing target for a datagram.
    pub fn find(&self, dcid: &ConnectionId) -> Option<Arc<Connection>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.by_dcid.get(dcid).cloned()
    }

    /// Look up a connection by its embedder-visible assigned id.
    pub fn find_by_id(&self, assigned_id: u64) -> Option<Arc<Connection>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.by_id.get(&assigned_id).cloned()
    }

    /// Snapshot of all live connections (used for endpoint teardown).
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.by_dcid.values().cloned().collect()
    }

    /// Ask the pacing loop to exit at its next wakeup.
    pub fn shutdown(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// Spawn the pacing thread.
    pub fn start(self: &Arc<Self>, reactor: Arc<UdpReactor>) -> std::io::Result<thread::JoinHandle<()>> {
        let pacer = self.clone();
        thread::Builder::new()
            .name("courier-pacer".into())
            .spawn(move || pacer.run(&reactor))
    }

    fn run(&self, reactor: &UdpReactor) {
        let mut scratch: Option<Box<SendBuffer>> = None;
        let mut interval = SEND_SLOW_INTERVAL;

        while !self.terminated.load(Ordering::Acquire) {
            thread::sleep(interval);

            let mut reaped: Vec<Arc<Connection>> = Vec::new();
            let mut send_fast = false;

            {
                let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();

                tables.by_dcid.retain(|_, conn| {
                    if conn.is_closed() {
                        reaped.push(conn.clone());
                        return false;
                    }
                    conn.on_tick(now);
                    if conn.flush_egress(&mut scratch) {
                        send_fast = true;
                    }
                    true
                });

                for conn in &reaped {
                    tables.by_id.remove(&conn.assigned_id());
                }
            }

            for _ in &reaped {
                CONNECTIONS_CLOSED.increment();
                CONNECTIONS_ACTIVE.decrement();
            }
            // Last strong references may drop here, outside the table lock.
            drop(reaped);

            interval = if send_fast {
                SEND_FAST_INTERVAL
            } else {
                SEND_SLOW_INTERVAL
            };
        }

        if let Some(buf) = scratch.take() {
            reactor.release(buf);
        }
    }
}
