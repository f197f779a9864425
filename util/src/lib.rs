//! Shared helpers for the TOS mining pool.
//!
//! Hex on the wire is always lowercase and never `0x`-prefixed (see spec
//! §9); the helpers here enforce that in one place so individual protocol
//! handlers don't each reinvent the normalization.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Decodes a wire hex string. Rejects a `0x` prefix — the wire format never
/// carries one, so a caller that does is already confused about the layer.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>, UtilError> {
    if s.starts_with("0x") || s.starts_with("0X") {
        return Err(UtilError::InvalidFormat(
            "0x-prefixed hex is not valid on the wire".to_string(),
        ));
    }
    Ok(hex::decode(s)?)
}

/// Encodes bytes as lowercase hex, no prefix.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Renders a 256-bit big-endian target as the 64-char lowercase hex string
/// the wire protocol expects.
pub fn target_to_hex(target: &[u8; 32]) -> String {
    hex::encode(target)
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Current Unix time in milliseconds, matching upstream node timestamps.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Normalizes an upstream timestamp (milliseconds) to the seconds
/// granularity storage and session bookkeeping use (spec §9).
pub fn millis_to_secs(millis: u64) -> u64 {
    millis / 1000
}

/// Formats a Unix timestamp (seconds) as ISO 8601.
pub fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "invalid timestamp".to_string())
}

/// Initializes `tracing` from `RUST_LOG` (or the given default directive).
pub fn init_logging(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// A fast, non-cryptographic PRNG draw in `[0, 100)`, used only for the
/// trust-based validation-skip sampling (spec §4.4) — never for anything
/// security sensitive.
pub fn sample_percent() -> u8 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_0x_prefixed_hex() {
        assert!(hex_to_bytes("0xdeadbeef").is_err());
        assert!(hex_to_bytes("deadbeef").is_ok());
    }

    #[test]
    fn target_hex_is_64_chars() {
        let target = [0xffu8; 32];
        assert_eq!(target_to_hex(&target).len(), 64);
    }

    #[test]
    fn millis_normalizes_to_secs() {
        assert_eq!(millis_to_secs(1_700_000_123_456), 1_700_000_123);
    }
}
