use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

fn random_url_safe<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random PKCE code verifier: 48 bytes, 64 URL-safe characters (RFC 7636 allows 43-128).
pub fn generate_code_verifier() -> String {
    random_url_safe::<48>()
}

/// `BASE64URL(SHA256(verifier))`, the S256 challenge.
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` parameter: 16 bytes, 22 URL-safe characters.
pub fn generate_state() -> String {
    random_url_safe::<16>()
}
