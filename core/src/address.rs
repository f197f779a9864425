//! Miner address handling.
//!
//! The pool never signs or constructs transactions itself (that's the
//! wallet's job — see spec §1 Non-goals), so an `Address` here is an opaque,
//! format-checked string rather than a decoded public key. Full checksum
//! verification belongs to the chain node / wallet, which the pool treats
//! as black boxes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address has invalid length: {0}")]
    InvalidLength(usize),

    #[error("address contains invalid characters")]
    InvalidCharset,
}

/// A miner's payout address, as presented in `authorize` (`<address>.<worker>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub const MIN_LEN: usize = 8;
    pub const MAX_LEN: usize = 128;

    /// Parses and format-checks a raw address string. Does not consult the
    /// blacklist — that is a Session Manager (C5) policy concern, not a
    /// parsing concern.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }
        if raw.len() < Self::MIN_LEN || raw.len() > Self::MAX_LEN {
            return Err(AddressError::InvalidLength(raw.len()));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AddressError::InvalidCharset);
        }
        Ok(Address(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Splits a Stratum `worker_name` field (`<address>.<worker>`) into its
/// address and worker parts. A missing `.worker` suffix is legal; the
/// worker name then defaults to `"default"`, matching common pool practice.
pub fn split_worker_name(worker_name: &str) -> (&str, &str) {
    match worker_name.split_once('.') {
        Some((addr, worker)) if !worker.is_empty() => (addr, worker),
        _ => (worker_name, "default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_address() {
        assert!(Address::parse("tos1qqqqqqqqqqqqqqqqqqqqqqqqqqqq").is_ok());
    }

    #[test]
    fn rejects_empty_and_short() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(Address::parse("abc"), Err(AddressError::InvalidLength(_))));
    }

    #[test]
    fn splits_worker_name() {
        assert_eq!(split_worker_name("tos1abc.rig1"), ("tos1abc", "rig1"));
        assert_eq!(split_worker_name("tos1abc"), ("tos1abc", "default"));
    }
}
