//! Share (Sh): an accepted submission.

use crate::address::Address;
use crate::job::JobId;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub session_id: SessionId,
    pub address: Address,
    pub worker: String,
    pub job_id: JobId,
    pub nonce: u64,

    /// Lowercase hex, no `0x` prefix.
    pub hash_hex: String,

    /// Difficulty at which this share was accepted (`d_s` at submit time).
    /// Invariant: `difficulty <= observed_difficulty`.
    pub difficulty: f64,

    pub height: u64,
    pub timestamp: u64,
    pub is_block: bool,
}
