use std::fmt;
use std::hash::{Hash, Hasher};

use rand::RngCore;

/// Length of locally generated connection ids.
pub const LOCAL_CONN_ID_LEN: usize = 16;

/// Maximum connection id length accepted on the wire (RFC 9000 limit).
pub const MAX_CONN_ID_LEN: usize = quiche::MAX_CONN_ID_LEN;

/// A QUIC connection identifier.
///
/// Fixed-capacity inline byte string. Equality is byte-exact over the used
/// prefix; the hash is FNV-1a over the used prefix so ids spread well in the
/// routing table regardless of how the peer generated them.
#[derive(Clone, Copy)]
pub struct ConnectionId {
    bytes: [u8; MAX_CONN_ID_LEN],
    len: usize,
}

impl ConnectionId {
    /// Generate a random id of [`LOCAL_CONN_ID_LEN`] bytes.
    pub fn random() -> Self {
        let mut bytes = [0u8; MAX_CONN_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..LOCAL_CONN_ID_LEN]);
        ConnectionId {
            bytes,
            len: LOCAL_CONN_ID_LEN,
        }
    }

    /// Copy an id from wire bytes, truncating at [`MAX_CONN_ID_LEN`].
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_CONN_ID_LEN);
        let mut bytes = [0u8; MAX_CONN_ID_LEN];
        bytes[..len].copy_from_slice(&slice[..len]);
        ConnectionId { bytes, len }
    }

    /// The used prefix of the id.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Number of bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the id has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn to_quiche(&self) -> quiche::ConnectionId<'_> {
        quiche::ConnectionId::from_ref(self.as_slice())
    }

    fn fnv1a(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for &b in self.as_slice() {
            hash = (hash ^ u32::from(b)).wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ConnectionId {}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.fnv1a());
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_slice() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self}, {} bytes)", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn equality_is_over_used_prefix() {
        let a = ConnectionId::from_slice(&[1, 2, 3]);
        let b = ConnectionId::from_slice(&[1, 2, 3]);
        let c = ConnectionId::from_slice(&[1, 2, 3, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn truncates_overlong_input() {
        let long = [0xabu8; 32];
        let cid = ConnectionId::from_slice(&long);
        assert_eq!(cid.len(), MAX_CONN_ID_LEN);
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        assert_eq!(a.len(), LOCAL_CONN_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        let a = ConnectionId::from_slice(&[9, 9, 9]);
        map.insert(a, 7u32);
        assert_eq!(map.get(&ConnectionId::from_slice(&[9, 9, 9])), Some(&7));
    }

    #[test]
    fn display_is_lowercase_hex() {
        let cid = ConnectionId::from_slice(&[0xde, 0xad, 0x01]);
        assert_eq!(cid.to_string(), "dead01");
    }
}
