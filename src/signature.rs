//! Callback signatures.
//!
//! The platform signs every callback with the SHA-1 of its parts sorted
//! byte-wise and concatenated without a separator: `{token, timestamp, nonce}`
//! for plain callbacks, plus the ciphertext for encrypted envelopes.

use rand::RngExt;
use sha1::{Digest, Sha1};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NONCE_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Hex SHA-1 over the sorted, concatenated parts.
pub fn sign(parts: &[&str]) -> String {
    let mut parts = parts.to_vec();
    parts.sort_unstable();

    let mut sha = Sha1::new();
    for part in parts {
        sha.update(part.as_bytes());
    }
    hex::encode(sha.finalize())
}

/// Signature of a plain callback (`signature` query parameter).
pub fn sign_request(token: &str, nonce: &str, timestamp: &str) -> String {
    sign(&[token, nonce, timestamp])
}

/// Signature of an encrypted envelope (`msg_signature` / `MsgSignature`).
pub fn sign_envelope(token: &str, nonce: &str, timestamp: &str, encrypt: &str) -> String {
    sign(&[token, nonce, timestamp, encrypt])
}

/// Handshake and POST gate: recompute the plain signature and compare.
pub fn is_valid_request(token: &str, nonce: &str, timestamp: &str, signature: &str) -> bool {
    sign_request(token, nonce, timestamp) == signature
}

pub fn random_nonce(len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut rng = rand::rng();
    for _ in 0..len {
        let idx = rng.random_range(0..NONCE_CHARSET.len());
        out.push(NONCE_CHARSET[idx] as char);
    }
    out
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
