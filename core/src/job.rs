//! Job (J): an atomic, immutable unit of mineable work.
//!
//! Jobs are immutable once broadcast (spec §3 "Ownership"); sessions only
//! ever hold a reference to a job by id, never a mutable handle.

use serde::{Deserialize, Serialize};

pub type JobId = String;

/// 256-bit big-endian target / header prefix, kept as raw bytes — the
/// algorithm's exact input framing is an opaque detail owned by the PoW
/// verifier (spec §9 open question (a)).
pub type Target = [u8; 32];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub height: u64,

    /// Fixed-size header prefix as supplied by the upstream template. The
    /// nonce is written into this at a protocol-defined offset by the
    /// validator, never mutated in place on the stored job.
    pub header_prefix: Vec<u8>,

    pub target: Target,
    pub difficulty: u64,

    /// Set when the upstream reports a height/parent change; cleared
    /// otherwise (spec §4.3).
    pub clean_jobs: bool,

    pub created_at: u64,

    /// When `get_block_template` returns an opaque blob rather than a
    /// header the pool can mutate directly, that blob is carried alongside
    /// so the validator can re-submit it verbatim with `miner_work`
    /// (spec §9 open question (b)).
    pub opaque_template: Option<Vec<u8>>,
}

impl Job {
    /// Whether a submission against this job is still within the stale
    /// grace period relative to the current job (spec §4.3: "≤ 30s").
    pub fn is_within_grace(&self, now: u64, grace_secs: u64) -> bool {
        now.saturating_sub(self.created_at) <= grace_secs
    }

    pub fn target_hex(&self) -> String {
        tos_pool_util::target_to_hex(&self.target)
    }

    pub fn header_hex(&self) -> String {
        tos_pool_util::bytes_to_hex(&self.header_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: "job-1".into(),
            height: 100,
            header_prefix: vec![0u8; 112],
            target: [0xffu8; 32],
            difficulty: 1_000_000,
            clean_jobs: false,
            created_at: 1000,
            opaque_template: None,
        }
    }

    #[test]
    fn grace_period_respects_age() {
        let j = job();
        assert!(j.is_within_grace(1010, 30));
        assert!(!j.is_within_grace(1040, 30));
    }

    #[test]
    fn header_hex_has_no_prefix() {
        assert!(!job().header_hex().starts_with("0x"));
    }
}
