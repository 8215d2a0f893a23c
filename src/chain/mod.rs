pub mod fee;
pub mod sign;
pub mod template;

use std::time::{SystemTime, UNIX_EPOCH};

/// Witness size of a taproot key path spend: one Schnorr signature.
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
