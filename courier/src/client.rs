//! Client endpoint: one persistent session to a known server.
//!
//! Host resolution and the handshake run on the endpoint's own reactor
//! thread, so construction never blocks. The `Connect` event is surfaced
//! only after the server's certificate matches the pinned DER; a mismatch
//! or a resolution failure stops the endpoint, and the embedder observes
//! `is_running` turn false after any queued `Timeout` drains.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};

use crate::cert::load_pem_cert_as_der;
use crate::cid::ConnectionId;
use crate::config::{client_transport_config, ClientConfig, HEADER_INFO, USER_AGENT_CLIENT};
use crate::connection::Connection;
use crate::error::Error;
use crate::mailbox::{Event, Mailbox};
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::pacer::Pacer;
use crate::socket::UdpReactor;
use crate::stream::header;

/// HTTP/3 client endpoint.
pub struct Client {
    core: Arc<ClientCore>,
    reactor_thread: Option<thread::JoinHandle<()>>,
    pacer_thread: Option<thread::JoinHandle<()>>,
}

struct ClientCore {
    reactor: Arc<UdpReactor>,
    pacer: Arc<Pacer>,
    mailbox: Arc<Mailbox>,
    connection: Arc<Connection>,
    host: String,
    authorization: String,
    running: AtomicBool,
}

impl Client {
    /// Load the pinned certificate, bind an ephemeral port, and start the
    /// reactor and pacer threads. The handshake begins asynchronously once
    /// the host resolves.
    pub fn new(config: ClientConfig) -> Result<Client, Error> {
        config.validate()?;

        let pinned_cert = load_pem_cert_as_der(&config.cert_path)?;
        let transport_config = Arc::new(Mutex::new(client_transport_config(&config.cert_path)?));
        let reactor = Arc::new(UdpReactor::bind(0)?);
        let mailbox = Arc::new(Mailbox::new());
        let pacer = Pacer::new();

        let connection = Arc::new(Connection::new_client(
            reactor.clone(),
            mailbox.clone(),
            transport_config,
            pinned_cert,
        )?);
        pacer.insert(ConnectionId::random(), connection.clone());

        let core = Arc::new(ClientCore {
            reactor: reactor.clone(),
            pacer: pacer.clone(),
            mailbox,
            connection,
            host: config.host.clone(),
            authorization: format!("Bearer {}", config.auth_token),
            running: AtomicBool::new(true),
        });

        let reactor_thread = {
            let core = core.clone();
            let host = config.host;
            let port = config.port;
            thread::Builder::new()
                .name("courier-client-io".into())
                .spawn(move || core.resolve_and_run(&host, port))?
        };
        let pacer_thread = pacer.start(reactor)?;

        Ok(Client {
            core,
            reactor_thread: Some(reactor_thread),
            pacer_thread: Some(pacer_thread),
        })
    }

    /// True until the endpoint is closed, resolution fails, or the session
    /// times out.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire) && !self.core.connection.is_closed()
    }

    /// Drain mailbox events into `handler`, waiting up to `timeout_ms`
    /// (negative waits forever).
    ///
    /// Returns false once the endpoint is no longer running. The poll that
    /// first observes the session's end still drains, so the terminal
    /// `Timeout` event is always delivered.
    pub fn poll(&self, handler: impl FnMut(Event), timeout_ms: i32) -> bool {
        if !self.core.running.load(Ordering::Acquire) {
            return false;
        }

        let closed = self.core.connection.is_closed();
        self.core.mailbox.poll(handler, timeout_ms);
        if closed {
            self.core.running.store(false, Ordering::Release);
        }
        true
    }

    /// Send a request. GET when `body` is empty, PUT otherwise.
    ///
    /// Blocks in ~20 ms steps while transport flow control is exhausted.
    /// Returns the stream id (later echoed as the response's request id),
    /// or -1 on failure.
    pub fn request(&self, path: &str, content_type: &str, header_info: &str, body: &[u8]) -> i64 {
        if !self.is_running() {
            return -1;
        }

        let method = if body.is_empty() { "GET" } else { "PUT" };
        let mut headers = vec![
            header(":method", method),
            header(":scheme", "https"),
            header(":authority", &self.core.host),
            header(":path", path),
            header("user-agent", USER_AGENT_CLIENT),
            header("Authorization", &self.core.authorization),
        ];
        if !content_type.is_empty() {
            headers.push(header("content-type", content_type));
        }
        headers.push(header("content-length", &body.len().to_string()));
        if !header_info.is_empty() {
            headers.push(header(HEADER_INFO, header_info));
        }

        self.core.connection.send_request(&headers, body)
    }

    /// Stop the endpoint: announce GOAWAY, close the transport, wake
    /// pollers, stop both threads. Idempotent; `Drop` joins the threads.
    pub fn close(&self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.core.connection.close("client shutting down");
        self.core.mailbox.shutdown();
        self.core.pacer.shutdown();
        self.core.reactor.shutdown();
    }
}

impl Drop for Client {
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

impl ClientCore {
    /// Resolve the server, start the handshake, then run the receive loop.
    fn resolve_and_run(&self, host: &str, port: u16) {
        let peer = match resolve(host, port) {
            Ok(peer) => peer,
            Err(e) => {
                error!("failed to resolve {host}:{port}: {e}");
                self.fail();
                return;
            }
        };
        info!("connecting to {peer}");

        if let Err(e) = self.connection.connect(peer) {
            error!("connect failed: {e}");
            self.fail();
            return;
        }
        CONNECTIONS_ACCEPTED.increment();
        self.connection.flush();

        self.reactor.run(|data, from| {
            if from == peer {
                self.connection.on_datagram(data, from);
            } else {
                warn!("dropping datagram from unexpected endpoint {from}");
            }
        });
    }

    fn fail(&self) {
        self.running.store(false, Ordering::Release);
        self.mailbox.shutdown();
        self.pacer.shutdown();
        self.reactor.shutdown();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(e.to_string()))?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::Resolve(format!("no IPv4 address for {host}")))
}
