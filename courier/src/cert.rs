//! Pinned-certificate loading and comparison.

use std::fs::File;
use std::io::BufReader;

use crate::error::Error;

/// Load the first certificate from a PEM file as raw DER bytes.
pub fn load_pem_cert_as_der(path: &str) -> Result<Vec<u8>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::Certificate(format!("failed to open {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let result = match rustls_pemfile::certs(&mut reader).next() {
        Some(Ok(der)) => Ok(der.as_ref().to_vec()),
        Some(Err(e)) => Err(Error::Certificate(format!("failed to parse {path}: {e}"))),
        None => Err(Error::Certificate(format!("no certificate in {path}"))),
    };
    result
}

/// Byte comparison that does not short-circuit on the first difference.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn loads_pem_as_der() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let expected_der = cert.cert.der().as_ref().to_vec();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let path = file.path().to_str().unwrap();

        let der = load_pem_cert_as_der(path).unwrap();
        assert_eq!(der, expected_der);
    }

    #[test]
    fn rejects_missing_and_empty_files() {
        assert!(load_pem_cert_as_der("/nonexistent/cert.pem").is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert!(load_pem_cert_as_der(path).is_err());
    }
}
