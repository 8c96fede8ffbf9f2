//! courier — HTTP/3 request/response messaging over QUIC.
//!
//! courier exposes two endpoints built on the [quiche] transport: a
//! [`Client`] holding one persistent session to a known server, and a
//! [`Server`] accepting many sessions on a bound UDP port. Clients issue
//! requests and servers answer them over concurrent HTTP/3 streams; both
//! sides share the same polled event surface, and bodies are opaque bytes
//! tagged with a content type.
//!
//! Connections are authenticated in both directions: the server demands a
//! bearer token in the first request, and the client pins the server's
//! certificate byte-for-byte. Network events arrive through a polled
//! mailbox, so embedder threads never run on the I/O path.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use courier::{Client, ClientConfig, Direction, Event};
//!
//! let client = Client::new(ClientConfig {
//!     auth_token: "S3CRET".into(),
//!     host: "example.com".into(),
//!     port: 4433,
//!     cert_path: "server-cert.pem".into(),
//! })?;
//!
//! while client.poll(
//!     |event| match event {
//!         Event::Connect { peer, .. } => {
//!             println!("connected to {peer}");
//!             client.request("/simple.txt", "", "", b"");
//!         }
//!         Event::Data { stream, direction: Direction::Response, .. } => {
//!             println!("{} -> {} bytes", stream.status, stream.body.len());
//!         }
//!         _ => {}
//!     },
//!     100,
//! ) {}
//! # Ok::<(), courier::Error>(())
//! ```
//!
//! [quiche]: https://docs.rs/quiche

pub(crate) mod connection;
pub(crate) mod pacer;
pub(crate) mod socket;

pub mod cert;
pub mod cid;
pub mod client;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod stream;
pub mod token;

/// Load a PEM certificate as the DER bytes used for pinning.
pub use cert::load_pem_cert_as_der;
/// QUIC connection identifier.
pub use cid::ConnectionId;
/// Client endpoint: one persistent session to a known server.
pub use client::Client;
/// Client endpoint settings.
pub use config::ClientConfig;
/// Server endpoint settings.
pub use config::ServerConfig;
/// Endpoint errors.
pub use error::Error;
/// Whether a `Data` event carries a request or a response.
pub use mailbox::Direction;
/// Events delivered to the embedder.
pub use mailbox::Event;
/// Thread-safe polled event queue.
pub use mailbox::Mailbox;
/// Server endpoint: many peer sessions on one UDP port.
pub use server::Server;
/// A complete received request or response.
pub use stream::IncomingStream;
