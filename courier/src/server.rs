//! Server endpoint: many peer sessions on one bound UDP port.
//!
//! The router parses each datagram's QUIC header and either forwards it to
//! the owning connection, answers with version negotiation, or walks the
//! address-validation dance (RETRY with a minted token, then accept). The
//! first authenticated request on a connection surfaces the `Connect` event;
//! a bad bearer token closes the connection without one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};

use crate::cid::{ConnectionId, LOCAL_CONN_ID_LEN};
use crate::config::{server_transport_config, ServerConfig, HEADER_INFO, USER_AGENT_SERVER};
use crate::connection::Connection;
use crate::error::Error;
use crate::mailbox::{Event, Mailbox};
use crate::metrics::{
    CONNECTIONS_ACCEPTED, INVALID_TOKENS, RETRY_PACKETS_SENT, VERSION_NEGOTIATIONS_SENT,
};
use crate::pacer::Pacer;
use crate::socket::UdpReactor;
use crate::stream::header;
use crate::token::{mint_token, read_token};

/// HTTP/3 server endpoint.
pub struct Server {
    router: Arc<Router>,
    reactor_thread: Option<thread::JoinHandle<()>>,
    pacer_thread: Option<thread::JoinHandle<()>>,
}

struct Router {
    reactor: Arc<UdpReactor>,
    pacer: Arc<Pacer>,
    mailbox: Arc<Mailbox>,
    transport_config: Arc<Mutex<quiche::Config>>,
    authorization: String,
    next_assigned_id: AtomicU64,
    running: AtomicBool,
}

impl Server {
    /// Bind the port, load key material, and start the reactor and pacer
    /// threads. Fails if any required setting is missing or the certificate
    /// chain cannot be loaded.
    pub fn new(config: ServerConfig) -> Result<Server, Error> {
        config.validate()?;

        let transport_config = Arc::new(Mutex::new(server_transport_config(
            &config.cert_path,
            &config.key_path,
        )?));
        let reactor = Arc::new(UdpReactor::bind(config.port)?);

        let router = Arc::new(Router {
            reactor: reactor.clone(),
            pacer: Pacer::new(),
            mailbox: Arc::new(Mailbox::new()),
            transport_config,
            authorization: format!("Bearer {}", config.auth_token),
            next_assigned_id: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let reactor_thread = {
            let router = router.clone();
            thread::Builder::new()
                .name("courier-server-io".into())
                .spawn(move || {
                    let reactor = router.reactor.clone();
                    reactor.run(|data, peer| router.on_datagram(data, peer));
                })?
        };
        let pacer_thread = router.pacer.start(reactor)?;

        info!("server listening on udp {}", router.reactor.local_addr());

        Ok(Server {
            router,
            reactor_thread: Some(reactor_thread),
            pacer_thread: Some(pacer_thread),
        })
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.router.reactor.local_addr()
    }

    /// False once the endpoint has been closed.
    pub fn is_running(&self) -> bool {
        self.router.running.load(Ordering::Acquire)
    }

    /// Drain mailbox events into `handler`, waiting up to `timeout_ms`
    /// (negative waits forever). Returns false once the endpoint is no
    /// longer running.
    pub fn poll(&self, handler: impl FnMut(Event), timeout_ms: i32) -> bool {
        if !self.is_running() {
            return false;
        }
        self.router.mailbox.poll(handler, timeout_ms);
        true
    }

    /// Respond to a request received on `connection_id`.
    ///
    /// `request_id` is the stream id carried by the request's `Data` event.
    pub fn respond(
        &self,
        connection_id: u64,
        request_id: u64,
        status: u16,
        content_type: &str,
        header_info: &str,
        body: &[u8],
    ) -> Result<(), Error> {
        let conn = self
            .router
            .pacer
            .find_by_id(connection_id)
            .ok_or(Error::UnknownConnection(connection_id))?;

        let mut headers = vec![
            header(":status", &status.to_string()),
            header("server", USER_AGENT_SERVER),
            header("Authorization", &self.router.authorization),
        ];
        if !content_type.is_empty() {
            headers.push(header("content-type", content_type));
        }
        headers.push(header("content-length", &body.len().to_string()));
        if !header_info.is_empty() {
            headers.push(header(HEADER_INFO, header_info));
        }

        conn.send_response(request_id, headers, body);
        Ok(())
    }

    /// Close one peer session. The embedder sees its terminal `Timeout`
    /// event once the transport drains.
    pub fn close_connection(&self, connection_id: u64) -> Result<(), Error> {
        let conn = self
            .router
            .pacer
            .find_by_id(connection_id)
            .ok_or(Error::UnknownConnection(connection_id))?;
        conn.close("closed by application");
        Ok(())
    }

    /// Stop the endpoint: close every session, wake pollers, stop both
    /// threads. Idempotent; `Drop` joins the threads.
    pub fn close(&self) {
        if !self.router.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for conn in self.router.pacer.connections() {
            conn.close("server shutting down");
        }
        self.router.mailbox.shutdown();
        self.router.pacer.shutdown();
        self.router.reactor.shutdown();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
        if let Some(t) = self.reactor_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.pacer_thread.take() {
            let _ = t.join();
        }
    }
}

impl Router {
    fn on_datagram(&self, data: &mut [u8], peer: SocketAddr) {
        let (version, scid, dcid, token) = {
            let hdr = match quiche::Header::from_slice(data, LOCAL_CONN_ID_LEN) {
                Ok(hdr) => hdr,
                Err(e) => {
                    warn!("failed to parse packet header from {peer}: {e}");
                    return;
                }
            };
            (
                hdr.version,
                ConnectionId::from_slice(&hdr.scid),
                ConnectionId::from_slice(&hdr.dcid),
                hdr.token,
            )
        };

        if let Some(conn) = self.pacer.find(&dcid) {
            conn.on_datagram(data, peer);
            return;
        }

        if !quiche::version_is_supported(version) {
            warn!("new connection from {peer}: unsupported version {version:#x}");
            self.send_version_negotiation(&scid, &dcid, peer);
            return;
        }

        let token = token.unwrap_or_default();
        if token.is_empty() {
            // Address validation before any connection state exists.
            self.send_retry(&scid, &dcid, version, peer);
            return;
        }

        let Some(odcid) = read_token(&token, &peer) else {
            INVALID_TOKENS.increment();
            warn!("invalid address validation token from {peer}");
            return;
        };

        let Some(conn) = self.create_connection(&dcid, &odcid, peer) else {
            return;
        };
        conn.on_datagram(data, peer);
    }

    fn send_version_negotiation(&self, scid: &ConnectionId, dcid: &ConnectionId, peer: SocketAddr) {
        let mut buf = self.reactor.acquire();

        match quiche::negotiate_version(&scid.to_quiche(), &dcid.to_quiche(), buf.payload_mut()) {
            Ok(written) => {
                buf.set_len(written);
                self.reactor.send(buf, peer);
                VERSION_NEGOTIATIONS_SENT.increment();
            }
            Err(e) => {
                error!("failed to create version negotiation packet: {e}");
                self.reactor.release(buf);
            }
        }
    }

    fn send_retry(&self, scid: &ConnectionId, dcid: &ConnectionId, version: u32, peer: SocketAddr) {
        let new_scid = ConnectionId::random();
        let token = mint_token(dcid, &peer);
        let mut buf = self.reactor.acquire();

        match quiche::retry(
            &scid.to_quiche(),
            &dcid.to_quiche(),
            &new_scid.to_quiche(),
            &token,
            version,
            buf.payload_mut(),
        ) {
            Ok(written) => {
                buf.set_len(written);
                self.reactor.send(buf, peer);
                RETRY_PACKETS_SENT.increment();
            }
            Err(e) => {
                error!("failed to create retry packet: {e}");
                self.reactor.release(buf);
            }
        }
    }

    fn create_connection(
        &self,
        dcid: &ConnectionId,
        odcid: &ConnectionId,
        peer: SocketAddr,
    ) -> Option<Arc<Connection>> {
        let assigned_id = self.next_assigned_id.fetch_add(1, Ordering::Relaxed) + 1;

        let conn = match Connection::new_server(
            self.reactor.clone(),
            self.mailbox.clone(),
            self.transport_config.clone(),
            assigned_id,
            self.authorization.clone(),
        ) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                error!("failed to create connection state: {e}");
                return None;
            }
        };

        if let Err(e) = conn.accept(peer, dcid, odcid) {
            error!("accept failed for {peer}: {e}");
            return None;
        }

        self.pacer.insert(*dcid, conn.clone());
        CONNECTIONS_ACCEPTED.increment();
        info!("accepted connection {assigned_id} from {peer} (dcid {dcid})");
        Some(conn)
    }
}
