//! Cipher identifiers a tunnel may negotiate
//!
//! The identifier and the random key are carried in the hello; applying
//! the cipher is up to the relay pairing.

use lazy_static::lazy_static;
use std::collections::BTreeSet;

lazy_static! {
    static ref SUPPORTED_ALGOS: BTreeSet<&'static str> = [
        "aes-128-cfb",
        "aes-128-ctr",
        "aes-128-gcm",
        "aes-192-cfb",
        "aes-192-ctr",
        "aes-192-gcm",
        "aes-256-cfb",
        "aes-256-ctr",
        "aes-256-gcm",
        "camellia-256-cfb",
        "chacha20",
        "chacha20-poly1305",
    ]
    .into_iter()
    .collect();
}

/// Every supported cipher identifier, sorted
pub fn supported_algos() -> impl Iterator<Item = &'static str> {
    SUPPORTED_ALGOS.iter().copied()
}

/// Check whether `algo` can be negotiated (case-insensitive)
pub fn is_supported_algo(algo: &str) -> bool {
    SUPPORTED_ALGOS.contains(algo.to_ascii_lowercase().as_str())
}
