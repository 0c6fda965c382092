//! Peer authentication: PAP key comparison and CHAP over HMAC-SHA256

use crate::{Error, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Challenge length in bytes (hex-encoded on the wire)
pub const CHALLENGE_LEN: usize = 32;

/// Fresh random challenge, hex-encoded
pub fn new_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mac_for(shared_key: &str, challenge: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(shared_key.as_bytes())
        .map_err(|e| Error::auth(format!("invalid shared key: {}", e)))?;
    mac.update(challenge.as_bytes());
    Ok(mac)
}

/// Answer to a CHAP challenge: hex HMAC-SHA256 of the challenge under the key
pub fn chap_response(shared_key: &str, challenge: &str) -> Result<String> {
    Ok(hex::encode(mac_for(shared_key, challenge)?.finalize().into_bytes()))
}

/// Check a CHAP answer in constant time
pub fn verify_chap(shared_key: &str, challenge: &str, response: &str) -> bool {
    let Ok(expected) = hex::decode(response) else {
        return false;
    };
    match mac_for(shared_key, challenge) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

/// Compare a PAP key without short-circuiting on the first mismatch
pub fn verify_pap(shared_key: &str, provided: &str) -> bool {
    let (a, b) = (shared_key.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
