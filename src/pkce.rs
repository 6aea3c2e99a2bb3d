//! State nonce and PKCE (RFC 7636) helpers.

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

fn random_urlsafe(len: usize) -> String {
    let random_bytes: Vec<u8> = (0..len).map(|_| rand::thread_rng().gen()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

// 64 random bytes encode to 86 chars, inside the 43..=128 range RFC 7636 allows
pub fn generate_code_verifier() -> String {
    random_urlsafe(64)
}

pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

pub fn generate_state() -> String {
    random_urlsafe(64)
}
