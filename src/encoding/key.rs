//! # Order-Preserving Key Encoding
//!
//! B+tree nodes compare keys as raw bytes, so every key type must encode
//! to a byte string whose lexicographic order matches its logical order:
//!
//! - entry ids (`u64`) encode as 8-byte big-endian, so numeric order and
//!   byte order coincide;
//! - normalized DN strings and attribute values encode as their UTF-8
//!   bytes, which already sort lexicographically.
//!
//! This replaces runtime comparator objects: the total order lives in the
//! encoding, not in a callback.

use eyre::{ensure, Result};

/// Encodes an entry id as a big-endian key.
#[inline]
pub fn encode_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decodes an entry id from an 8-byte big-endian key.
#[inline]
pub fn decode_id(bytes: &[u8]) -> Result<u64> {
    ensure!(
        bytes.len() == 8,
        "id key must be 8 bytes, got {}",
        bytes.len()
    );
    let mut be = [0u8; 8];
    be.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(be))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_keys_sort_numerically() {
        let ids = [0u64, 1, 255, 256, 65535, 1 << 32, u64::MAX];
        let mut encoded: Vec<[u8; 8]> = ids.iter().map(|&i| encode_id(i)).collect();
        encoded.sort();
        let decoded: Vec<u64> = encoded.iter().map(|b| decode_id(b).unwrap()).collect();
        assert_eq!(decoded, ids.to_vec());
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert!(decode_id(&[1, 2, 3]).is_err());
        assert!(decode_id(&[0; 9]).is_err());
    }
}
