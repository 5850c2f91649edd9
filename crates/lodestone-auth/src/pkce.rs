use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::errors::{AuthError, Result};

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes).map_err(|e| AuthError::Random(e.to_string()))?;
    Ok(bytes)
}

/// Random PKCE code verifier, 64 URL-safe characters (RFC 7636 allows 43-128)
pub fn generate_code_verifier() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<48>()?))
}

/// S256 code challenge: `BASE64URL(SHA256(verifier))`
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random OAuth `state` parameter
pub fn generate_state() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<16>()?))
}

/// Random identifier for a provider account handle
pub fn generate_account_id() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<18>()?))
}
