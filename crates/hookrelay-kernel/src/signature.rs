//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Check `header` (`sha256=<hex>`) against an HMAC-SHA256 of `raw` keyed by
/// `secret`. With no secret every delivery passes. Never panics; a missing or
/// malformed header is simply `false`.
pub fn verify(raw: &[u8], header: Option<&str>, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(digest) = header.and_then(|header| header.trim().strip_prefix(PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw);
    mac.verify_slice(&expected).is_ok()
}

/// Header value a provider would send for `raw`.
pub fn sign(raw: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(raw);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
