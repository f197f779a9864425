//! Session (S): a live miner connection and its mutable mining state.
//!
//! Per spec §9/"Design Notes", a session's mutable state is owned by the
//! session's own task; other components address it by id through the
//! manager rather than holding a back-pointer that could outlive it. This
//! type is the state itself — `tos-pool-mining` is the component that owns
//! and mutates it.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub type SessionId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedWorker {
    pub address: Address,
    pub worker: String,
}

/// A live miner connection. Field names mirror spec §3 verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    pub authorized: Option<AuthorizedWorker>,

    /// Current target difficulty assigned to this session (`d_s`).
    pub difficulty: f64,

    /// Pool-assigned extranonce1, unique across the pool's lifetime.
    pub extranonce1: String,
    pub extranonce2_size: usize,

    /// Monotone non-decreasing while valid shares arrive; reset to 0 on ban.
    pub trust_score: f64,

    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub stale_shares: u64,

    pub last_share_at: u64,
    pub created_at: u64,

    /// Vardiff bookkeeping: start of the current retarget window and the
    /// accepted-share count since then.
    pub vardiff_window_start: u64,
    pub shares_since_window_start: u64,

    /// Current job id this session was last notified of; used to decide
    /// whether a submit against an older job is within the stale grace
    /// period (spec §4.3 CleanJobs semantics).
    pub current_job_id: Option<String>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        extranonce1: String,
        extranonce2_size: usize,
        initial_difficulty: f64,
        now: u64,
    ) -> Self {
        Session {
            id,
            peer_addr,
            authorized: None,
            difficulty: initial_difficulty,
            extranonce1,
            extranonce2_size,
            trust_score: 0.0,
            valid_shares: 0,
            invalid_shares: 0,
            stale_shares: 0,
            last_share_at: now,
            created_at: now,
            vardiff_window_start: now,
            shares_since_window_start: 0,
            current_job_id: None,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.is_some()
    }

    pub fn invalid_ratio(&self) -> f64 {
        let total = self.valid_shares + self.invalid_shares;
        if total == 0 {
            0.0
        } else {
            self.invalid_shares as f64 / total as f64
        }
    }

    /// Records a valid share: bumps counters and trust, never lets trust
    /// decrease on success (spec §4.4: "monotone non-decreasing").
    pub fn record_valid_share(&mut self, now: u64) {
        self.valid_shares += 1;
        self.shares_since_window_start += 1;
        self.last_share_at = now;
        self.trust_score += 1.0;
    }

    pub fn record_invalid_share(&mut self, now: u64) {
        self.invalid_shares += 1;
        self.last_share_at = now;
        self.trust_score = (self.trust_score - 2.0).max(0.0);
    }

    pub fn record_stale_share(&mut self, now: u64) {
        self.stale_shares += 1;
        self.last_share_at = now;
    }

    /// A full trust reset, used when trust-skipped validation later fails
    /// (spec §4.4: "drops trust to 0, closes the session").
    pub fn reset_trust(&mut self) {
        self.trust_score = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sess() -> Session {
        Session::new(1, "127.0.0.1:3333".parse().unwrap(), "ab01".into(), 4, 1.0, 1000)
    }

    #[test]
    fn trust_never_decreases_on_valid_shares() {
        let mut s = sess();
        s.record_valid_share(1001);
        s.record_valid_share(1002);
        assert_eq!(s.trust_score, 2.0);
    }

    #[test]
    fn invalid_ratio_is_zero_with_no_shares() {
        assert_eq!(sess().invalid_ratio(), 0.0);
    }

    #[test]
    fn invalid_ratio_computed_correctly() {
        let mut s = sess();
        s.record_valid_share(1001);
        s.record_invalid_share(1002);
        s.record_invalid_share(1003);
        assert!((s.invalid_ratio() - (2.0 / 3.0)).abs() < 1e-9);
    }
}
