//! Digest helpers for the carrier handshake

use super::types::{Digest, HASH_WIDTH_IN_BYTES};
use rand::RngCore;
use sha2::{Digest as Sha2Digest, Sha256};

/// Compute the SHA-256 digest of `data`
///
/// ```
/// use tunsocks::protocol::digest;
///
/// let hash = digest(b"alice:secret");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn digest(data: &[u8]) -> Digest {
    let d = Sha256::new().chain_update(data).finalize();
    let mut result = [0u8; HASH_WIDTH_IN_BYTES];
    result.copy_from_slice(&d);
    result
}

/// Random 32-byte value, used for nonces and session ids
pub fn random_digest() -> Digest {
    let mut out = [0u8; HASH_WIDTH_IN_BYTES];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Random key material of `len` bytes for a new tunnel
pub fn random_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        // SHA-256("test")
        let hash = digest(b"test");
        assert_eq!(&hash[..4], &[0x9f, 0x86, 0xd0, 0x81]);
        assert_eq!(&hash[28..], &[0xb0, 0xf0, 0x0a, 0x08]);
    }

    #[test]
    fn test_random_digest_differs() {
        assert_ne!(random_digest(), random_digest());
    }

    #[test]
    fn test_random_key_length() {
        assert_eq!(random_key(33).len(), 33);
        assert_eq!(random_key(128).len(), 128);
        assert!(random_key(0).is_empty());
    }
}
