//! Endpoint configuration and transport tuning.
//!
//! The QUIC parameters here are the protocol contract of a courier
//! deployment: both sides must agree on ALPN, datagram sizing, and stream
//! limits, so they are fixed constants rather than knobs.

use std::env;
use std::fs::OpenOptions;
use std::time::Duration;

use crate::error::Error;

/// Largest datagram handed to the socket for sending.
pub const MAX_DATAGRAM_SEND_SIZE: usize = 1350;

/// Receive scratch size; generously above any coalesced datagram we accept.
pub const MAX_DATAGRAM_RECV_SIZE: usize = 1400 * 2;

/// Concurrent bidirectional and unidirectional stream limit, each.
pub const MAX_PARALLEL_STREAMS: u64 = 8;

/// Connection-wide flow control limit.
const INITIAL_MAX_DATA: u64 = 8 * 1024 * 1024;

/// Per-stream flow control limit.
const INITIAL_MAX_STREAM_DATA: u64 = 1024 * 1024;

/// Transport idle timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Kernel socket buffer size, both directions.
pub(crate) const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Pacer tick while the last pass produced no datagrams.
pub const SEND_SLOW_INTERVAL: Duration = Duration::from_millis(20);

/// Pacer tick while egress is flowing.
pub const SEND_FAST_INTERVAL: Duration = Duration::from_millis(10);

/// Client handshake deadline before `connect` is retried.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// SNI presented by clients and expected in server certificates.
pub const TLS_SERVER_NAME: &str = "catid.io";

/// Custom header carrying an opaque application string end to end.
pub const HEADER_INFO: &str = "quicsend-header-info";

/// `user-agent` sent with client-initiated requests.
pub const USER_AGENT_CLIENT: &str = "quicsend-client";

/// `user-agent` / `server` value for the server endpoint.
pub const USER_AGENT_SERVER: &str = "quicsend-server";

/// Settings for a [`Server`](crate::Server) endpoint. All fields required.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret clients must present as `Authorization: Bearer <token>`.
    pub auth_token: String,
    /// UDP port to bind.
    pub port: u16,
    /// Path to the certificate chain, PEM.
    pub cert_path: String,
    /// Path to the private key, PEM.
    pub key_path: String,
}

impl ServerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.auth_token.is_empty() {
            return Err(Error::InvalidConfig("auth_token is required"));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port is required"));
        }
        if self.cert_path.is_empty() {
            return Err(Error::InvalidConfig("cert_path is required"));
        }
        if self.key_path.is_empty() {
            return Err(Error::InvalidConfig("key_path is required"));
        }
        Ok(())
    }
}

/// Settings for a [`Client`](crate::Client) endpoint. All fields required.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Shared secret sent as `Authorization: Bearer <token>`.
    pub auth_token: String,
    /// Server host name or address.
    pub host: String,
    /// Server UDP port.
    pub port: u16,
    /// Path to the server certificate to pin, PEM.
    pub cert_path: String,
}

impl ClientConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.auth_token.is_empty() {
            return Err(Error::InvalidConfig("auth_token is required"));
        }
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host is required"));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port is required"));
        }
        if self.cert_path.is_empty() {
            return Err(Error::InvalidConfig("cert_path is required"));
        }
        Ok(())
    }
}

/// Shared transport tuning for both roles.
fn base_transport_config() -> Result<quiche::Config, Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)?;

    config.set_max_idle_timeout(IDLE_TIMEOUT.as_millis() as u64);

    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SEND_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SEND_SIZE);

    config.set_initial_max_data(INITIAL_MAX_DATA);
    config.set_initial_max_stream_data_bidi_local(INITIAL_MAX_STREAM_DATA);
    config.set_initial_max_stream_data_bidi_remote(INITIAL_MAX_STREAM_DATA);
    config.set_initial_max_stream_data_uni(INITIAL_MAX_STREAM_DATA);

    config.set_initial_max_streams_bidi(MAX_PARALLEL_STREAMS);
    config.set_initial_max_streams_uni(MAX_PARALLEL_STREAMS);

    // Migration only helps mobile clients and adds handshake delay.
    config.set_disable_active_migration(true);

    config.enable_early_data();
    config.enable_pacing(true);

    // BBR measures a bit faster than BBR2 for bulk request bodies.
    config.set_cc_algorithm(quiche::CongestionControlAlgorithm::BBR);

    if env::var("SSLKEYLOGFILE").is_ok() {
        config.log_keys();
    }

    Ok(config)
}

/// Transport config for the server role: presents the certificate chain,
/// does not demand client certificates (the bearer token authenticates).
pub(crate) fn server_transport_config(
    cert_path: &str,
    key_path: &str,
) -> Result<quiche::Config, Error> {
    let mut config = base_transport_config()?;
    config.load_cert_chain_from_pem_file(cert_path)?;
    config.load_priv_key_from_pem_file(key_path)?;
    config.verify_peer(false);
    Ok(config)
}

/// Transport config for the client role: verifies the peer against the
/// pinned certificate, which is also installed as the trust root so a
/// pinned self-signed certificate validates.
pub(crate) fn client_transport_config(cert_path: &str) -> Result<quiche::Config, Error> {
    let mut config = base_transport_config()?;
    config.load_verify_locations_from_file(cert_path)?;
    config.verify_peer(true);
    Ok(config)
}

/// Attach a keylog writer to a new connection when `SSLKEYLOGFILE` is set.
pub(crate) fn attach_keylog(conn: &mut quiche::Connection) {
    let Ok(path) = env::var("SSLKEYLOGFILE") else {
        return;
    };
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => conn.set_keylog(Box::new(file)),
        Err(e) => log::warn!("failed to open SSLKEYLOGFILE {path}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_requires_all_fields() {
        let good = ServerConfig {
            auth_token: "secret".into(),
            port: 4433,
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        };
        assert!(good.validate().is_ok());

        let mut missing = good.clone();
        missing.auth_token.clear();
        assert!(missing.validate().is_err());

        let mut missing = good.clone();
        missing.port = 0;
        assert!(missing.validate().is_err());

        let mut missing = good.clone();
        missing.key_path.clear();
        assert!(missing.validate().is_err());
    }

    #[test]
    fn client_config_requires_all_fields() {
        let good = ClientConfig {
            auth_token: "secret".into(),
            host: "localhost".into(),
            port: 4433,
            cert_path: "cert.pem".into(),
        };
        assert!(good.validate().is_ok());

        let mut missing = good.clone();
        missing.host.clear();
        assert!(missing.validate().is_err());

        let mut missing = good;
        missing.cert_path.clear();
        assert!(missing.validate().is_err());
    }
}
