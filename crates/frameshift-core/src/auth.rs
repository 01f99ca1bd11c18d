//! Salted-hash request authentication between cluster nodes.
//!
//! Both sides hold a shared token. The sender picks a random salt and sends
//! `salt:hex(SHA-256(salt || payload || token))` in the `X-Auth` header; the
//! receiver recomputes over the request body with its own token. The salt
//! varies the digest per call; the protocol is stateless and carries no nonce
//! store. Verification is constant-time.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Header carrying the auth value on every inter-node request.
pub const AUTH_HEADER: &str = "x-auth";

const SALT_BYTES: usize = 16;

/// Build the `salt:hexhash` header value for an outbound payload.
/// An empty payload is valid (GET requests).
pub fn generate(payload: &[u8], token: &str) -> String {
    let salt: [u8; SALT_BYTES] = rand::thread_rng().gen();
    let salt_hex = hex::encode(salt);
    format!("{}:{}", salt_hex, digest(&salt_hex, payload, token))
}

/// Verify an inbound header against the request body. Returns false on any
/// malformed header; the caller answers 401 without further detail.
pub fn verify(payload: &[u8], header: &str, token: &str) -> bool {
    let Some((salt, claimed)) = header.split_once(':') else {
        return false;
    };
    if salt.is_empty() || claimed.is_empty() {
        return false;
    }
    let expected = digest(salt, payload, token);
    constant_time_eq::constant_time_eq(expected.as_bytes(), claimed.trim().as_bytes())
}

fn digest(salt: &str, payload: &[u8], token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(payload);
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
