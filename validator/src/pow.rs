//! The proof-of-work hash itself is treated as an opaque verifier (spec §1
//! Out-of-scope, §9 open question (a)): this module only defines the
//! trait boundary and the difficulty arithmetic around whatever hash a
//! concrete implementation produces. No mining algorithm lives here.

use num_bigint::BigUint;
use std::sync::Arc;

pub type PowHash = [u8; 32];

/// A deterministic PoW hash function over a fixed-width header. The actual
/// algorithm is supplied by the deployment (spec's "opaque verifier");
/// this crate never assumes anything about its internals beyond determinism
/// and a fixed 32-byte output.
pub trait PowVerifier: Send + Sync {
    fn hash(&self, header: &[u8]) -> PowHash;
}

pub type SharedVerifier = Arc<dyn PowVerifier>;

/// `max_target / hash_as_big_int`, integer division, truncating (spec §4.4
/// step 4). `hash` is treated as a big-endian 256-bit integer.
pub fn observed_difficulty(max_target: &[u8; 32], hash: &PowHash) -> u64 {
    let hash_int = BigUint::from_bytes_be(hash);
    if hash_int == BigUint::from(0u32) {
        return u64::MAX;
    }
    let max_target_int = BigUint::from_bytes_be(max_target);
    let quotient = max_target_int / hash_int;
    quotient.try_into().unwrap_or(u64::MAX)
}

/// `max_target / difficulty`, rendered as the 64-char lowercase hex string
/// the wire protocol expects for a job's target (spec §4.4 edge case).
pub fn target_for_difficulty(max_target: &[u8; 32], difficulty: u64) -> [u8; 32] {
    if difficulty == 0 {
        return *max_target;
    }
    let max_target_int = BigUint::from_bytes_be(max_target);
    let target_int = max_target_int / BigUint::from(difficulty);
    let bytes = target_int.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    out
}

/// Default double-SHA256 verifier. The actual TOS header hash is an
/// external, deployment-supplied concern (spec §1/§9); this is the fallback
/// wired in by default so the pool runs standalone, and deployments that
/// need the real algorithm swap in their own `PowVerifier` impl at startup.
pub struct DoubleSha256;

impl PowVerifier for DoubleSha256 {
    fn hash(&self, header: &[u8]) -> PowHash {
        use sha2::{Digest, Sha256};
        let first = Sha256::digest(header);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

#[cfg(test)]
pub mod test_support {
    pub use super::DoubleSha256;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_difficulty_of_max_target_hash_is_one() {
        let max_target = [0xffu8; 32];
        assert_eq!(observed_difficulty(&max_target, &max_target), 1);
    }

    #[test]
    fn smaller_hash_yields_higher_difficulty() {
        let max_target = [0xffu8; 32];
        let mut small_hash = [0u8; 32];
        small_hash[31] = 1;
        let d = observed_difficulty(&max_target, &small_hash);
        assert!(d > 1_000_000);
    }

    #[test]
    fn zero_hash_saturates_to_max() {
        let max_target = [0xffu8; 32];
        assert_eq!(observed_difficulty(&max_target, &[0u8; 32]), u64::MAX);
    }

    #[test]
    fn target_for_difficulty_one_is_max_target() {
        let max_target = [0xffu8; 32];
        assert_eq!(target_for_difficulty(&max_target, 1), max_target);
    }

    #[test]
    fn target_shrinks_as_difficulty_grows() {
        let max_target = [0xffu8; 32];
        let t1 = target_for_difficulty(&max_target, 1_000);
        let t2 = target_for_difficulty(&max_target, 1_000_000);
        assert!(BigUintOrd::le_bytes(&t2, &t1));
    }

    struct BigUintOrd;
    impl BigUintOrd {
        fn le_bytes(a: &[u8; 32], b: &[u8; 32]) -> bool {
            num_bigint::BigUint::from_bytes_be(a) <= num_bigint::BigUint::from_bytes_be(b)
        }
    }
}
