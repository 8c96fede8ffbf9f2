//! One QUIC+HTTP/3 session.
//!
//! A connection owns the transport handle, the HTTP/3 handle, and the
//! per-stream registries, all behind one mutex. Public entry points lock at
//! the top frame; the internal helpers take the already-locked state, which
//! keeps ingress, egress, and embedder calls serialized without a re-entrant
//! lock.
//!
//! The `timed_out` flag is monotonic. Once set, every public operation is a
//! no-op, arriving datagrams are dropped, and the pacer is free to reap the
//! connection.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use log::{error, info, warn};
use quiche::h3::NameValue;

use crate::cert::constant_time_eq;
use crate::cid::ConnectionId;
use crate::config::{
    attach_keylog, CONNECT_TIMEOUT, MAX_DATAGRAM_RECV_SIZE, SEND_SLOW_INTERVAL, TLS_SERVER_NAME,
};
use crate::error::Error;
use crate::mailbox::{Direction, Event, Mailbox};
use crate::metrics::{AUTH_FAILURES, CERT_MISMATCHES};
use crate::pool::SendBuffer;
use crate::socket::UdpReactor;
use crate::stream::{CachedResponse, IncomingStream, OutgoingStream};

/// Mutable session state, guarded by the connection lock.
struct ConnectionInner {
    conn: Option<quiche::Connection>,
    h3: Option<quiche::h3::Connection>,
    h3_config: quiche::h3::Config,

    peer: SocketAddr,

    /// Streams currently accumulating headers/body, by stream id.
    incoming: HashMap<u64, IncomingStream>,
    /// Unsent body suffixes awaiting transport capacity, by stream id.
    outgoing: HashMap<u64, OutgoingStream>,
    /// Responses whose headers were refused outright.
    response_cache: Vec<CachedResponse>,
    /// Stream ids we sent a request on; their FIN carries a response.
    expecting_response: HashSet<u64>,

    /// Client only: when to re-issue `connect` if still not established.
    handshake_deadline: Option<Instant>,
    /// When to fire the transport's timeout callback.
    timeout_at: Option<Instant>,

    goaway_sent: bool,
    timeout_posted: bool,
    highest_processed_stream: u64,

    /// Scratch for draining HTTP/3 body chunks.
    body_buf: Vec<u8>,
}

/// One peer session, shared between the reactor, the pacer, and embedders.
pub(crate) struct Connection {
    assigned_id: u64,
    is_server: bool,
    reactor: Arc<UdpReactor>,
    mailbox: Arc<Mailbox>,
    transport_config: Arc<Mutex<quiche::Config>>,

    /// Server: the exact `Bearer <token>` line peers must present.
    authorization: String,
    /// Client: DER bytes the peer certificate must match.
    pinned_cert: Vec<u8>,

    timed_out: AtomicBool,
    connected: AtomicBool,

    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new_server(
        reactor: Arc<UdpReactor>,
        mailbox: Arc<Mailbox>,
        transport_config: Arc<Mutex<quiche::Config>>,
        assigned_id: u64,
        authorization: String,
    ) -> Result<Connection, Error> {
        Self::new(
            reactor,
            mailbox,
            transport_config,
            assigned_id,
            true,
            authorization,
            Vec::new(),
        )
    }

    pub fn new_client(
        reactor: Arc<UdpReactor>,
        mailbox: Arc<Mailbox>,
        transport_config: Arc<Mutex<quiche::Config>>,
        pinned_cert: Vec<u8>,
    ) -> Result<Connection, Error> {
        Self::new(
            reactor,
            mailbox,
            transport_config,
            0,
            false,
            String::new(),
            pinned_cert,
        )
    }

    fn new(
        reactor: Arc<UdpReactor>,
        mailbox: Arc<Mailbox>,
        transport_config: Arc<Mutex<quiche::Config>>,
        assigned_id: u64,
        is_server: bool,
        authorization: String,
        pinned_cert: Vec<u8>,
    ) -> Result<Connection, Error> {
        let h3_config = quiche::h3::Config::new()?;

        Ok(Connection {
            assigned_id,
            is_server,
            reactor,
            mailbox,
            transport_config,
            authorization,
            pinned_cert,
            timed_out: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            inner: Mutex::new(ConnectionInner {
                conn: None,
                h3: None,
                h3_config,
                peer: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
                incoming: HashMap::new(),
                outgoing: HashMap::new(),
                response_cache: Vec::new(),
                expecting_response: HashSet::new(),
                handshake_deadline: None,
                timeout_at: None,
                goaway_sent: false,
                timeout_posted: false,
                highest_processed_stream: 0,
                body_buf: vec![0u8; MAX_DATAGRAM_RECV_SIZE],
            }),
        })
    }

    pub fn assigned_id(&self) -> u64 {
        self.assigned_id
    }

    /// True once the session has timed out or been closed. Monotonic.
    pub fn is_closed(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// True once the peer is established and authenticated.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Session setup ───────────────────────────────────────────────

    /// Server side: create transport state for a validated initial packet.
    pub fn accept(
        &self,
        peer: SocketAddr,
        dcid: &ConnectionId,
        odcid: &ConnectionId,
    ) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.peer = peer;

        let mut config = self
            .transport_config
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut conn = quiche::accept(
            &dcid.to_quiche(),
            Some(&odcid.to_quiche()),
            self.reactor.local_addr(),
            peer,
            &mut config,
        )?;
        attach_keylog(&mut conn);
        inner.conn = Some(conn);
        Ok(())
    }

    /// Client side: start a handshake and arm the handshake deadline.
    pub fn connect(&self, peer: SocketAddr) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.connect_locked(inner, peer)
    }

    fn connect_locked(&self, inner: &mut ConnectionInner, peer: SocketAddr) -> Result<(), Error> {
        inner.peer = peer;

        let scid = ConnectionId::random();
        let mut config = self
            .transport_config
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut conn = quiche::connect(
            Some(TLS_SERVER_NAME),
            &scid.to_quiche(),
            self.reactor.local_addr(),
            peer,
            &mut config,
        )?;
        attach_keylog(&mut conn);

        inner.conn = Some(conn);
        inner.h3 = None;
        inner.handshake_deadline = Some(Instant::now() + CONNECT_TIMEOUT);
        Ok(())
    }

    // ── Ingress ─────────────────────────────────────────────────────

    /// Feed one received datagram to the transport and drain its effects.
    pub fn on_datagram(&self, data: &mut [u8], peer: SocketAddr) {
        if self.is_closed() {
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.peer = peer;

        let local = self.reactor.local_addr();
        {
            let Some(conn) = inner.conn.as_mut() else {
                return;
            };
            if let Err(e) = conn.recv(
                data,
                quiche::RecvInfo {
                    from: peer,
                    to: local,
                },
            ) {
                error!("transport failed to process packet: {e}");
                return;
            }
        }

        let established = inner
            .conn
            .as_ref()
            .map(|c| c.is_established())
            .unwrap_or(false);
        if established {
            if inner.h3.is_none() {
                let created = {
                    let Some(conn) = inner.conn.as_mut() else {
                        return;
                    };
                    quiche::h3::Connection::with_transport(conn, &inner.h3_config)
                };
                match created {
                    Ok(h3) => inner.h3 = Some(h3),
                    Err(e) => {
                        error!("failed to create HTTP/3 session: {e}");
                        return;
                    }
                }
                self.on_transport_established(inner);
            }

            self.process_h3_events(inner);
        }

        let closed = inner
            .conn
            .as_ref()
            .map(|c| c.is_closed())
            .unwrap_or(false);
        if closed {
            self.mark_timed_out(inner);
            return;
        }

        self.flush_inline(inner);
    }

    /// First handshake completion: pin the certificate (client) and surface
    /// the session.
    fn on_transport_established(&self, inner: &mut ConnectionInner) {
        if self.is_server {
            info!(
                "connection {} established from {}",
                self.assigned_id, inner.peer
            );
            // Connect is surfaced once the first request authenticates.
            return;
        }

        if self.compare_peer_cert(inner) {
            self.connected.store(true, Ordering::Release);
            self.mailbox.post(Event::Connect {
                connection_id: self.assigned_id,
                peer: inner.peer,
            });
        }
    }

    /// Compare the transport's peer certificate against the pinned DER.
    fn compare_peer_cert(&self, inner: &mut ConnectionInner) -> bool {
        let Some(conn) = inner.conn.as_mut() else {
            return false;
        };

        if self.pinned_cert.is_empty() {
            warn!("no pinned peer certificate to check");
            return true;
        }

        match conn.peer_cert() {
            Some(der) if constant_time_eq(der, &self.pinned_cert) => {
                info!("verified peer certificate ({} bytes)", der.len());
                true
            }
            _ => {
                CERT_MISMATCHES.increment();
                error!("connection aborted: peer certificate does not match");
                let _ = conn.close(true, 0, b"Peer certificate does not match");
                false
            }
        }
    }

    fn process_h3_events(&self, inner: &mut ConnectionInner) {
        loop {
            let polled = match (inner.conn.as_mut(), inner.h3.as_mut()) {
                (Some(conn), Some(h3)) => h3.poll(conn),
                _ => return,
            };

            match polled {
                Ok((stream_id, event)) => self.handle_h3_event(inner, stream_id, event),
                Err(quiche::h3::Error::Done) => break,
                Err(e) => {
                    error!("HTTP/3 poll failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_h3_event(&self, inner: &mut ConnectionInner, stream_id: u64, event: quiche::h3::Event) {
        match event {
            quiche::h3::Event::Headers { list, .. } => {
                let stream = inner
                    .incoming
                    .entry(stream_id)
                    .or_insert_with(|| IncomingStream::new(stream_id));
                for h in &list {
                    stream.on_header(h.name(), h.value());
                }
            }

            quiche::h3::Event::Data => loop {
                let len = match (inner.conn.as_mut(), inner.h3.as_mut()) {
                    (Some(conn), Some(h3)) => {
                        match h3.recv_body(conn, stream_id, &mut inner.body_buf) {
                            Ok(len) => len,
                            Err(quiche::h3::Error::Done) => break,
                            Err(e) => {
                                error!("recv_body failed on stream {stream_id}: {e}");
                                break;
                            }
                        }
                    }
                    _ => break,
                };
                if len == 0 {
                    break;
                }
                let stream = inner
                    .incoming
                    .entry(stream_id)
                    .or_insert_with(|| IncomingStream::new(stream_id));
                stream.on_data(&inner.body_buf[..len]);
            },

            quiche::h3::Event::Finished => {
                // Ignore FINs for streams already destroyed.
                let Some(stream) = inner.incoming.remove(&stream_id) else {
                    return;
                };
                if stream_id > inner.highest_processed_stream {
                    inner.highest_processed_stream = stream_id;
                }
                let direction = if inner.expecting_response.remove(&stream_id) {
                    Direction::Response
                } else {
                    Direction::Request
                };
                self.on_stream_finished(inner, stream, direction);
            }

            quiche::h3::Event::Reset(_) => {
                self.destroy_stream(inner, stream_id);
            }

            quiche::h3::Event::PriorityUpdate => {}

            quiche::h3::Event::GoAway => {
                info!("connection {} aborted: received GOAWAY", self.assigned_id);
                if let Some(conn) = inner.conn.as_mut() {
                    let _ = conn.close(true, 0, b"received GOAWAY");
                }
            }
        }
    }

    /// A stream's FIN was observed: authenticate (server), then surface it.
    fn on_stream_finished(
        &self,
        inner: &mut ConnectionInner,
        stream: IncomingStream,
        direction: Direction,
    ) {
        if self.is_server {
            if !self.is_connected() {
                if stream.authorization == self.authorization {
                    self.connected.store(true, Ordering::Release);
                    self.mailbox.post(Event::Connect {
                        connection_id: self.assigned_id,
                        peer: inner.peer,
                    });
                } else {
                    AUTH_FAILURES.increment();
                    warn!("connection {}: invalid auth token", self.assigned_id);
                    self.close_locked(inner, "invalid auth token");
                    return;
                }
            }

            self.mailbox.post(Event::Data {
                connection_id: self.assigned_id,
                stream,
                direction,
            });
        } else {
            let stream_id = stream.id;
            if self.is_connected() {
                self.mailbox.post(Event::Data {
                    connection_id: self.assigned_id,
                    stream,
                    direction,
                });
            } else {
                warn!("dropping stream {stream_id} finished before connect");
            }
            // No further exchange is expected on a client stream once the
            // response has arrived.
            self.destroy_stream(inner, stream_id);
        }
    }

    fn destroy_stream(&self, inner: &mut ConnectionInner, stream_id: u64) {
        if let Some(conn) = inner.conn.as_mut() {
            let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Read, 0);
            let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Write, 0);
        }
        inner.incoming.remove(&stream_id);
        inner.outgoing.remove(&stream_id);
    }

    // ── Requests and responses ──────────────────────────────────────

    /// Serialize request headers, then queue the body.
    ///
    /// Retries every [`SEND_SLOW_INTERVAL`] while the transport reports the
    /// stream blocked or the stream limit reached, bounded only by the
    /// connection timing out. Returns the stream id, or -1 on failure.
    pub fn send_request(&self, headers: &[quiche::h3::Header], body: &[u8]) -> i64 {
        loop {
            if self.is_closed() {
                return -1;
            }

            {
                let mut guard = self.lock();
                let inner = &mut *guard;

                // A closing transport will never unblock; stop retrying.
                let closing = inner
                    .conn
                    .as_ref()
                    .map(|c| c.is_closed() || c.local_error().is_some() || c.peer_error().is_some())
                    .unwrap_or(true);
                if closing {
                    return -1;
                }

                let established = inner
                    .conn
                    .as_ref()
                    .map(|c| c.is_established())
                    .unwrap_or(false);

                let result = match (inner.conn.as_mut(), inner.h3.as_mut()) {
                    (Some(conn), Some(h3)) => h3.send_request(conn, headers, body.is_empty()),
                    _ => {
                        warn!("request before session is ready");
                        return -1;
                    }
                };

                match result {
                    Ok(stream_id) => {
                        inner.expecting_response.insert(stream_id);
                        self.queue_body(inner, stream_id, body);
                        self.flush_inline(inner);
                        return stream_id as i64;
                    }
                    Err(quiche::h3::Error::StreamBlocked)
                    | Err(quiche::h3::Error::TransportError(quiche::Error::StreamLimit))
                        if established =>
                    {
                        // Flow control will drain; retry below.
                    }
                    Err(e) => {
                        error!("failed to send request: {e}");
                        return -1;
                    }
                }
            }

            thread::sleep(SEND_SLOW_INTERVAL);
        }
    }

    /// Serialize response headers for `stream_id`, then queue the body.
    ///
    /// When the transport refuses the headers, the whole response is cached
    /// on the connection and retried from the egress flush until accepted.
    /// Returns false if the response was cached or dropped.
    pub fn send_response(
        &self,
        stream_id: u64,
        headers: Vec<quiche::h3::Header>,
        body: &[u8],
    ) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let established = inner
            .conn
            .as_ref()
            .map(|c| c.is_established())
            .unwrap_or(false);

        let result = match (inner.conn.as_mut(), inner.h3.as_mut()) {
            (Some(conn), Some(h3)) => h3.send_response(conn, stream_id, &headers, body.is_empty()),
            _ => return false,
        };

        match result {
            Ok(()) => {
                self.queue_body(inner, stream_id, body);
                self.flush_inline(inner);
                true
            }
            Err(quiche::h3::Error::StreamBlocked) if established => {
                inner.response_cache.push(CachedResponse {
                    stream_id,
                    headers,
                    body: Bytes::copy_from_slice(body),
                });
                false
            }
            Err(e) => {
                error!("failed to send response headers on stream {stream_id}: {e}");
                false
            }
        }
    }

    /// Hand a body to the transport; park whatever it refuses.
    ///
    /// An empty body is a no-op (the headers carried FIN). Otherwise the
    /// accepted prefix goes out now and the unsent suffix, or a pending FIN,
    /// is parked in the outgoing registry for the pacer.
    fn queue_body(&self, inner: &mut ConnectionInner, stream_id: u64, body: &[u8]) {
        if body.is_empty() {
            return;
        }

        let (conn, h3) = match (inner.conn.as_mut(), inner.h3.as_mut()) {
            (Some(conn), Some(h3)) => (conn, h3),
            _ => return,
        };

        let written = match h3.send_body(conn, stream_id, body, false) {
            Ok(n) => n,
            Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => 0,
            Err(e) => {
                error!("failed to send body on stream {stream_id}: {e}");
                return;
            }
        };

        if written < body.len() {
            inner
                .outgoing
                .insert(stream_id, OutgoingStream::new(stream_id, body[written..].to_vec()));
            return;
        }

        match h3.send_body(conn, stream_id, &[], true) {
            Ok(_) => {}
            Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                // FIN did not fit; park an empty transfer so it is retried.
                inner
                    .outgoing
                    .insert(stream_id, OutgoingStream::new(stream_id, Vec::new()));
            }
            Err(e) => {
                error!("failed to finish stream {stream_id}: {e}");
            }
        }
    }

    // ── Egress ──────────────────────────────────────────────────────

    /// Drain pending responses, parked bodies, and transport datagrams.
    ///
    /// `scratch` carries a reusable send buffer between calls; on return it
    /// holds the last unused buffer, if any. Returns true if any datagram
    /// went out, which the pacer uses to shorten its next tick.
    pub fn flush_egress(&self, scratch: &mut Option<Box<SendBuffer>>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.flush_egress_locked(inner, scratch)
    }

    fn flush_egress_locked(
        &self,
        inner: &mut ConnectionInner,
        scratch: &mut Option<Box<SendBuffer>>,
    ) -> bool {
        self.flush_cached_responses(inner);
        self.flush_transfers(inner);

        let mut sent = false;
        loop {
            let Some(conn) = inner.conn.as_mut() else {
                break;
            };
            let mut buf = scratch
                .take()
                .unwrap_or_else(|| self.reactor.acquire());

            match conn.send(buf.payload_mut()) {
                Ok((written, send_info)) => {
                    buf.set_len(written);
                    self.reactor.send(buf, send_info.to);
                    sent = true;
                }
                Err(quiche::Error::Done) => {
                    *scratch = Some(buf);
                    break;
                }
                Err(e) => {
                    error!("failed to create packet: {e}");
                    *scratch = Some(buf);
                    break;
                }
            }
        }

        self.tick_timeout(inner);
        sent
    }

    /// Flush with a one-shot scratch buffer.
    pub fn flush(&self) -> bool {
        let mut scratch = None;
        let sent = self.flush_egress(&mut scratch);
        if let Some(buf) = scratch {
            self.reactor.release(buf);
        }
        sent
    }

    /// Flush with a throwaway scratch buffer (for paths inside the lock).
    fn flush_inline(&self, inner: &mut ConnectionInner) {
        let mut scratch = None;
        self.flush_egress_locked(inner, &mut scratch);
        if let Some(buf) = scratch {
            self.reactor.release(buf);
        }
    }

    /// Retry responses whose headers the transport previously refused.
    fn flush_cached_responses(&self, inner: &mut ConnectionInner) {
        if inner.response_cache.is_empty() {
            return;
        }

        let cached = std::mem::take(&mut inner.response_cache);
        let mut still_blocked = Vec::new();

        for response in cached {
            let established = inner
                .conn
                .as_ref()
                .map(|c| c.is_established())
                .unwrap_or(false);

            let result = match (inner.conn.as_mut(), inner.h3.as_mut()) {
                (Some(conn), Some(h3)) => h3.send_response(
                    conn,
                    response.stream_id,
                    &response.headers,
                    response.body.is_empty(),
                ),
                _ => {
                    still_blocked.push(response);
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    self.queue_body(inner, response.stream_id, &response.body);
                }
                Err(quiche::h3::Error::StreamBlocked) if established => {
                    still_blocked.push(response);
                }
                Err(e) => {
                    error!(
                        "failed to resend cached response on stream {}: {e}",
                        response.stream_id
                    );
                }
            }
        }

        inner.response_cache = still_blocked;
    }

    /// Retry parked body suffixes, oldest progress first.
    ///
    /// A stream that drains completely gets its FIN and is removed; a stream
    /// that makes partial progress stops the scan (the transport is out of
    /// room, so the rest would only fail too).
    fn flush_transfers(&self, inner: &mut ConnectionInner) {
        if inner.outgoing.is_empty() {
            return;
        }

        let ids: Vec<u64> = inner.outgoing.keys().copied().collect();
        let mut completed = Vec::new();

        'streams: for id in ids {
            let (conn, h3) = match (inner.conn.as_mut(), inner.h3.as_mut()) {
                (Some(conn), Some(h3)) => (conn, h3),
                _ => break,
            };
            let Some(stream) = inner.outgoing.get_mut(&id) else {
                continue;
            };

            let remaining = stream.buf.len() - stream.send_offset;

            if remaining == 0 {
                // Only the FIN is left over.
                match h3.send_body(conn, id, &[], true) {
                    Ok(_) => completed.push(id),
                    Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                        break 'streams;
                    }
                    Err(e) => {
                        error!("failed to finish stream {id}: {e}");
                        completed.push(id);
                    }
                }
                continue;
            }

            let written = match h3.send_body(conn, id, stream.remaining(), false) {
                Ok(n) => n,
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                    break 'streams;
                }
                Err(e) => {
                    error!("failed to send body on stream {id}: {e}");
                    completed.push(id);
                    continue;
                }
            };

            if written < remaining {
                stream.send_offset += written;
                break 'streams;
            }

            stream.buf.clear();
            stream.send_offset = 0;

            match h3.send_body(conn, id, &[], true) {
                Ok(_) => completed.push(id),
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                    break 'streams;
                }
                Err(e) => {
                    error!("failed to finish stream {id}: {e}");
                    completed.push(id);
                }
            }
        }

        for id in completed {
            inner.outgoing.remove(&id);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Re-arm the transport timeout deadline, or surface a closed transport.
    fn tick_timeout(&self, inner: &mut ConnectionInner) {
        let Some(conn) = inner.conn.as_mut() else {
            return;
        };

        if conn.is_closed() {
            self.mark_timed_out(inner);
            return;
        }

        inner.timeout_at = match conn.timeout() {
            Some(timeout) if timeout.is_zero() => {
                conn.on_timeout();
                None
            }
            Some(timeout) => Some(Instant::now() + timeout),
            None => None,
        };
    }

    /// Pacer tick: expire the handshake and transport deadlines.
    pub fn on_tick(&self, now: Instant) {
        if self.is_closed() {
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(deadline) = inner.handshake_deadline {
            let established = inner
                .conn
                .as_ref()
                .map(|c| c.is_established())
                .unwrap_or(false);
            // A transport that is closing or already carries an error is not
            // retried; the timeout path surfaces it instead.
            let healthy = inner
                .conn
                .as_ref()
                .map(|c| !c.is_closed() && c.local_error().is_none() && c.peer_error().is_none())
                .unwrap_or(false);
            if established {
                inner.handshake_deadline = None;
            } else if healthy && now >= deadline {
                info!("handshake timed out, retrying connect to {}", inner.peer);
                let peer = inner.peer;
                if let Err(e) = self.connect_locked(inner, peer) {
                    error!("handshake retry failed: {e}");
                }
            }
        }

        if let Some(at) = inner.timeout_at {
            if now >= at {
                inner.timeout_at = None;
                if let Some(conn) = inner.conn.as_mut() {
                    conn.on_timeout();
                }
            }
        }
    }

    /// Surface the terminal Timeout event exactly once and latch the flag.
    fn mark_timed_out(&self, inner: &mut ConnectionInner) {
        if !inner.timeout_posted {
            inner.timeout_posted = true;
            self.mailbox.post(Event::Timeout {
                connection_id: self.assigned_id,
            });
        }
        self.timed_out.store(true, Ordering::Release);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Announce GOAWAY if HTTP/3 is up, close the transport, and flush the
    /// close packet out. Idempotent once the connection has timed out.
    pub fn close(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.close_locked(inner, reason);
        self.flush_inline(inner);
    }

    fn close_locked(&self, inner: &mut ConnectionInner, reason: &str) {
        if !inner.goaway_sent {
            let last_stream = inner.highest_processed_stream;
            if let (Some(conn), Some(h3)) = (inner.conn.as_mut(), inner.h3.as_mut()) {
                if let Err(e) = h3.send_goaway(conn, last_stream) {
                    if !matches!(e, quiche::h3::Error::Done) {
                        warn!("failed to send GOAWAY: {e}");
                    }
                }
                inner.goaway_sent = true;
            }
        }

        if let Some(conn) = inner.conn.as_mut() {
            match conn.close(true, 0, reason.as_bytes()) {
                Ok(()) | Err(quiche::Error::Done) => {}
                Err(e) => warn!("transport close failed: {e}"),
            }
        }
    }
}
