//! UDP reactor: socket ownership, receive loop, datagram sends.
//!
//! One socket per endpoint. The receive loop runs on the endpoint's reactor
//! thread and hands each datagram to the endpoint's dispatch closure; it
//! never calls embedder code directly. Sends release their buffer back to
//! the pool whether or not the kernel accepted the full payload.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::warn;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{MAX_DATAGRAM_RECV_SIZE, SOCKET_BUFFER_SIZE};
use crate::error::Error;
use crate::metrics::{UDP_DATAGRAMS_RECEIVED, UDP_DATAGRAMS_SENT, UDP_SEND_FAILURES};
use crate::pool::{SendBuffer, SendBufferPool};

/// Interval at which the receive loop rechecks the shutdown flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the UDP socket and the send-buffer pool.
pub(crate) struct UdpReactor {
    socket: UdpSocket,
    local_addr: SocketAddr,
    pool: SendBufferPool,
    running: AtomicBool,
}

impl UdpReactor {
    /// Bind a reactor socket. Port 0 picks an ephemeral port (client role).
    pub fn bind(port: u16) -> Result<UdpReactor, Error> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&bind_addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        Ok(UdpReactor {
            socket,
            local_addr,
            pool: SendBufferPool::new(),
            running: AtomicBool::new(true),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the receive loop on the calling thread until [`shutdown`].
    ///
    /// [`shutdown`]: UdpReactor::shutdown
    pub fn run(&self, mut dispatch: impl FnMut(&mut [u8], SocketAddr)) {
        let mut scratch = [0u8; MAX_DATAGRAM_RECV_SIZE];

        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut scratch) {
                Ok((len, peer)) if len > 0 => {
                    UDP_DATAGRAMS_RECEIVED.increment();
                    dispatch(&mut scratch[..len], peer);
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("udp receive failed: {e}");
                    }
                }
            }
        }
    }

    /// Send one datagram and return its buffer to the pool.
    pub fn send(&self, buf: Box<SendBuffer>, dest: SocketAddr) {
        match self.socket.send_to(buf.filled(), dest) {
            Ok(sent) if sent == buf.len() => {
                UDP_DATAGRAMS_SENT.increment();
            }
            Ok(sent) => {
                UDP_SEND_FAILURES.increment();
                warn!("short udp send: {sent} of {} bytes to {dest}", buf.len());
            }
            Err(e) => {
                UDP_SEND_FAILURES.increment();
                warn!("udp send to {dest} failed: {e}");
            }
        }
        self.pool.release(buf);
    }

    /// Take a send buffer from the pool.
    pub fn acquire(&self) -> Box<SendBuffer> {
        self.pool.acquire()
    }

    /// Return an unused send buffer to the pool.
    pub fn release(&self, buf: Box<SendBuffer>) {
        self.pool.release(buf);
    }

    /// Ask the receive loop to exit at its next wakeup.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn receives_and_dispatches() {
        let reactor = Arc::new(UdpReactor::bind(0).unwrap());
        let addr = reactor.local_addr();
        let (tx, rx) = mpsc::channel();

        let handle = {
            let reactor = reactor.clone();
            thread::spawn(move || {
                reactor.run(move |data, peer| {
                    tx.send((data.to_vec(), peer)).ok();
                });
            })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port());
        sender.send_to(b"ping", dest).unwrap();

        let (data, peer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(peer.port(), sender.local_addr().unwrap().port());

        reactor.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn send_returns_buffer_to_pool() {
        let reactor = UdpReactor::bind(0).unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut buf = reactor.acquire();
        buf.payload_mut()[..4].copy_from_slice(b"data");
        buf.set_len(4);
        reactor.send(buf, sink.local_addr().unwrap());

        // The buffer is back in the pool after the send completes.
        assert_eq!(reactor.pool.idle(), 1);
    }

    #[test]
    fn shutdown_stops_run_promptly() {
        let reactor = Arc::new(UdpReactor::bind(0).unwrap());
        let handle = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.run(|_, _| {}))
        };
        thread::sleep(Duration::from_millis(20));
        reactor.shutdown();
        let start = std::time::Instant::now();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
