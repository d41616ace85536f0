//! HMAC-SHA256 webhook signatures.
//!
//! The signed message is `"{timestamp}." || body`, hex encoded. Receivers
//! recompute it from the `X-Webhook-Timestamp` header and the raw body, and
//! should reject timestamps that are too old.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

fn mac_for(secret: &str, timestamp: u64, payload: &[u8]) -> HmacSha256 {
    // HMAC takes keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Hex signature over `"{timestamp}.{payload}"`.
pub fn sign(secret: &str, timestamp: u64, payload: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, payload).finalize().into_bytes())
}

/// Constant-time check of a hex signature.
pub fn verify(secret: &str, timestamp: u64, payload: &[u8], signature: &str) -> bool {
    match hex::decode(signature) {
        Ok(raw) => mac_for(secret, timestamp, payload).verify_slice(&raw).is_ok(),
        Err(_) => false,
    }
}
