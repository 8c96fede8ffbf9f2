use std::io;

use thiserror::Error;

/// Errors returned by courier endpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// A required configuration value is missing or empty.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// QUIC transport error.
    #[error("transport: {0}")]
    Transport(#[from] quiche::Error),

    /// HTTP/3 layer error.
    #[error("http/3: {0}")]
    Http3(#[from] quiche::h3::Error),

    /// Certificate loading or conversion failed.
    #[error("certificate: {0}")]
    Certificate(String),

    /// The connection has timed out or been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No connection with the given assigned id.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Host name resolution failed.
    #[error("host resolution: {0}")]
    Resolve(String),

    /// Socket I/O error.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
