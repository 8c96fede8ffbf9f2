//! Address-validation retry tokens.
//!
//! The server will not create connection state for an initial packet that
//! does not carry a token; it instead mints one binding the client's claimed
//! address to its original destination connection id and sends it back in a
//! RETRY packet. A replayed initial carrying the token proves the client can
//! receive at that address.
//!
//! Wire format:
//!
//! ```text
//! byte 0      tag (0xdc)
//! byte 1      dcid length
//! byte 2      1 if the peer is IPv4, else 0
//! bytes 3..5  peer port, little-endian
//! bytes 5..   dcid
//! then        4 bytes IPv4 (little-endian u32) or 16 bytes IPv6
//! ```

use std::net::SocketAddr;

use crate::cid::{ConnectionId, MAX_CONN_ID_LEN};

/// First byte of every token this endpoint mints.
pub const TOKEN_TAG: u8 = 0xdc;

/// Upper bound on minted token size.
pub const MAX_TOKEN_LEN: usize = 5 + MAX_CONN_ID_LEN + 16;

/// Mint a retry token binding `dcid` to the peer's address and port.
pub fn mint_token(dcid: &ConnectionId, peer: &SocketAddr) -> Vec<u8> {
    let mut token = Vec::with_capacity(MAX_TOKEN_LEN);

    token.push(TOKEN_TAG);
    token.push(dcid.len() as u8);
    token.push(u8::from(peer.is_ipv4()));
    token.extend_from_slice(&peer.port().to_le_bytes());
    token.extend_from_slice(dcid.as_slice());

    match peer.ip() {
        std::net::IpAddr::V4(v4) => {
            token.extend_from_slice(&u32::from(v4).to_le_bytes());
        }
        std::net::IpAddr::V6(v6) => {
            token.extend_from_slice(&v6.octets());
        }
    }

    token
}

/// Validate a token against the current peer address.
///
/// Returns the original destination connection id recovered from the token,
/// or `None` if the tag, length, port, or address do not check out.
pub fn read_token(token: &[u8], peer: &SocketAddr) -> Option<ConnectionId> {
    if token.len() < 5 + 4 {
        return None;
    }
    if token[0] != TOKEN_TAG {
        return None;
    }

    let dcid_len = token[1] as usize;
    if dcid_len == 0 || dcid_len > MAX_CONN_ID_LEN {
        return None;
    }
    let is_v4 = token[2] != 0;
    let port = u16::from_le_bytes([token[3], token[4]]);
    if peer.port() != port {
        return None;
    }

    let rest = &token[5..];
    if rest.len() < dcid_len {
        return None;
    }
    let (dcid, addr) = rest.split_at(dcid_len);

    match peer.ip() {
        std::net::IpAddr::V4(v4) => {
            if !is_v4 || addr.len() < 4 {
                return None;
            }
            let bound = u32::from_le_bytes([addr[0], addr[1], addr[2], addr[3]]);
            if bound != u32::from(v4) {
                return None;
            }
        }
        std::net::IpAddr::V6(v6) => {
            if is_v4 || addr.len() < 16 {
                return None;
            }
            if addr[..16] != v6.octets() {
                return None;
            }
        }
    }

    Some(ConnectionId::from_slice(dcid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

    fn v4_peer(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(203, 0, 113, 7).into(), port)
    }

    fn v6_peer(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x42).into(), port)
    }

    #[test]
    fn round_trip_all_dcid_lengths() {
        for len in 1..=MAX_CONN_ID_LEN {
            let bytes: Vec<u8> = (0..len as u8).collect();
            let dcid = ConnectionId::from_slice(&bytes);

            for peer in [v4_peer(4433), v6_peer(65535)] {
                let token = mint_token(&dcid, &peer);
                let odcid = read_token(&token, &peer).expect("valid token rejected");
                assert_eq!(odcid, dcid, "dcid mismatch at len {len}");
            }
        }
    }

    #[test]
    fn rejects_wrong_tag() {
        let dcid = ConnectionId::random();
        let peer = v4_peer(1234);
        let mut token = mint_token(&dcid, &peer);
        token[0] ^= 0x01;
        assert!(read_token(&token, &peer).is_none());
    }

    #[test]
    fn rejects_corrupt_length() {
        let dcid = ConnectionId::random();
        let peer = v4_peer(1234);
        for bit in 0..8 {
            let mut token = mint_token(&dcid, &peer);
            token[1] ^= 1 << bit;
            assert!(
                read_token(&token, &peer).is_none(),
                "corrupt length accepted (bit {bit})"
            );
        }
    }

    #[test]
    fn rejects_flipped_address_family() {
        let dcid = ConnectionId::random();
        let peer = v4_peer(1234);
        let mut token = mint_token(&dcid, &peer);
        token[2] ^= 0x01;
        assert!(read_token(&token, &peer).is_none());
    }

    #[test]
    fn rejects_port_mismatch() {
        let dcid = ConnectionId::random();
        let peer = v4_peer(1234);
        let mut token = mint_token(&dcid, &peer);
        token[3] ^= 0x01;
        assert!(read_token(&token, &peer).is_none());

        // Same token, different source port.
        let token = mint_token(&dcid, &peer);
        assert!(read_token(&token, &v4_peer(1235)).is_none());
    }

    #[test]
    fn rejects_address_mismatch() {
        let dcid = ConnectionId::random();

        let peer = v4_peer(9000);
        let mut token = mint_token(&dcid, &peer);
        let addr_off = token.len() - 4;
        token[addr_off] ^= 0x01;
        assert!(read_token(&token, &peer).is_none());

        let peer = v6_peer(9000);
        let mut token = mint_token(&dcid, &peer);
        let addr_off = token.len() - 16;
        token[addr_off] ^= 0x01;
        assert!(read_token(&token, &peer).is_none());
    }

    #[test]
    fn rejects_truncation() {
        let dcid = ConnectionId::random();
        let peer = v6_peer(4433);
        let token = mint_token(&dcid, &peer);
        for cut in 0..token.len() {
            assert!(
                read_token(&token[..cut], &peer).is_none(),
                "truncated token of {cut} bytes accepted"
            );
        }
    }

    #[test]
    fn rejects_empty_and_oversized_dcid() {
        let peer = v4_peer(4433);
        let dcid = ConnectionId::random();
        let mut token = mint_token(&dcid, &peer);
        token[1] = 0;
        assert!(read_token(&token, &peer).is_none());
        token[1] = (MAX_CONN_ID_LEN + 1) as u8;
        assert!(read_token(&token, &peer).is_none());
    }
}
