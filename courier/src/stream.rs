//! Per-stream request/response state.
//!
//! An [`IncomingStream`] accumulates headers and body between the first
//! HEADERS event and the FIN; at FIN it is extracted from the registry and
//! handed to the mailbox whole. An [`OutgoingStream`] exists only while the
//! transport has refused part of a body; it holds the unsent suffix until
//! the pacer drains it.

use bytes::Bytes;

use crate::config::HEADER_INFO;

/// Headers and body of one in-flight incoming exchange.
#[derive(Debug, Default)]
pub struct IncomingStream {
    /// HTTP/3 stream id, doubling as the embedder-visible request id.
    pub id: u64,
    /// `:method` pseudo-header (requests).
    pub method: String,
    /// `:path` pseudo-header (requests).
    pub path: String,
    /// `:status` pseudo-header (responses).
    pub status: String,
    /// `Authorization` header, as sent.
    pub authorization: String,
    /// `content-type` header.
    pub content_type: String,
    /// Opaque application string carried in the info header.
    pub header_info: String,
    /// Append-only body bytes.
    pub body: Vec<u8>,
}

impl IncomingStream {
    pub fn new(id: u64) -> Self {
        IncomingStream {
            id,
            ..Default::default()
        }
    }

    /// Route one received header into its slot. Unknown headers are ignored.
    pub fn on_header(&mut self, name: &[u8], value: &[u8]) {
        let value = String::from_utf8_lossy(value);
        match name {
            b":method" => self.method = value.into_owned(),
            b":path" => self.path = value.into_owned(),
            b":status" => self.status = value.into_owned(),
            b"content-type" => self.content_type = value.into_owned(),
            _ if name.eq_ignore_ascii_case(b"authorization") => {
                self.authorization = value.into_owned();
            }
            _ if name.eq_ignore_ascii_case(HEADER_INFO.as_bytes()) => {
                self.header_info = value.into_owned();
            }
            _ => {}
        }
    }

    /// Append a body chunk.
    pub fn on_data(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Parsed `:status`, or 0 when absent or malformed.
    pub fn status_code(&self) -> i32 {
        self.status.parse().unwrap_or(0)
    }
}

/// The unsent suffix of a body the transport pushed back on.
///
/// An empty `buf` means the body was fully accepted but the closing FIN was
/// not; the pacer keeps retrying the FIN until it fits.
#[derive(Debug)]
pub struct OutgoingStream {
    pub id: u64,
    pub buf: Vec<u8>,
    pub send_offset: usize,
}

impl OutgoingStream {
    pub fn new(id: u64, buf: Vec<u8>) -> Self {
        OutgoingStream {
            id,
            buf,
            send_offset: 0,
        }
    }

    /// Bytes still waiting for the transport.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.send_offset..]
    }
}

/// A response whose headers the transport refused outright.
///
/// Held on the connection and retried from the egress flush until the
/// headers are accepted, at which point the body follows the normal
/// [`OutgoingStream`] path.
pub(crate) struct CachedResponse {
    pub stream_id: u64,
    pub headers: Vec<quiche::h3::Header>,
    pub body: Bytes,
}

impl std::fmt::Debug for CachedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedResponse")
            .field("stream_id", &self.stream_id)
            .field("headers", &self.headers.len())
            .field("body", &self.body.len())
            .finish()
    }
}

/// Build an owned h3 header.
pub(crate) fn header(name: &str, value: &str) -> quiche::h3::Header {
    quiche::h3::Header::new(name.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_route_into_slots() {
        let mut stream = IncomingStream::new(4);
        stream.on_header(b":method", b"PUT");
        stream.on_header(b":path", b"/upload");
        stream.on_header(b":status", b"200");
        stream.on_header(b"Authorization", b"Bearer secret");
        stream.on_header(b"content-type", b"text/plain");
        stream.on_header(b"quicsend-header-info", b"tag-123");
        stream.on_header(b"x-unknown", b"ignored");

        assert_eq!(stream.method, "PUT");
        assert_eq!(stream.path, "/upload");
        assert_eq!(stream.status, "200");
        assert_eq!(stream.status_code(), 200);
        assert_eq!(stream.authorization, "Bearer secret");
        assert_eq!(stream.content_type, "text/plain");
        assert_eq!(stream.header_info, "tag-123");
    }

    #[test]
    fn authorization_match_is_case_insensitive() {
        let mut stream = IncomingStream::new(0);
        stream.on_header(b"authorization", b"Bearer lower");
        assert_eq!(stream.authorization, "Bearer lower");
    }

    #[test]
    fn body_appends_in_order() {
        let mut stream = IncomingStream::new(0);
        stream.on_data(b"hel");
        stream.on_data(b"lo");
        assert_eq!(stream.body, b"hello");
    }

    #[test]
    fn outgoing_remaining_tracks_offset() {
        let mut out = OutgoingStream::new(8, vec![1, 2, 3, 4]);
        assert_eq!(out.remaining(), &[1, 2, 3, 4]);
        out.send_offset = 3;
        assert_eq!(out.remaining(), &[4]);
    }
}
