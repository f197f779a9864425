//! Block (B): a share whose hash met the network target, and its lifecycle.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Candidate,
    Immature,
    Matured,
    Orphan,
}

/// The per-address round-share snapshot taken atomically at block
/// discovery (spec §4.2 WriteBlock). Keys are payout addresses; values are
/// accumulated difficulty in the round up to and including the block.
pub type RoundShareSnapshot = HashMap<Address, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,

    /// Lowercase hex hash, no `0x` prefix.
    pub hash: String,

    pub finder_address: Address,
    pub finder_worker: String,

    /// `miner_reward + total_fees` as credited by upstream (§6).
    pub declared_reward: u64,

    pub round_shares: RoundShareSnapshot,
    pub round_shares_total: f64,

    pub status: BlockStatus,
    pub confirmations: u64,
    pub discovered_at: u64,

    /// Set once immature credits have actually been applied, so an orphan
    /// reversal only undoes work that was really done (spec §4.6:
    /// "reverse only the credits that were actually applied").
    pub immature_credited: bool,
}

impl Block {
    pub fn round_share_of(&self, address: &Address) -> f64 {
        self.round_shares.get(address).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        let mut shares = HashMap::new();
        let a = Address::parse("tos1qqqqqqqqqqqqqqqqqqqqqqqqqqqq").unwrap();
        shares.insert(a.clone(), 42.0);
        Block {
            height: 10,
            hash: "ab01".into(),
            finder_address: a,
            finder_worker: "rig1".into(),
            declared_reward: 1_000_000,
            round_shares: shares,
            round_shares_total: 42.0,
            status: BlockStatus::Candidate,
            confirmations: 0,
            discovered_at: 1000,
            immature_credited: false,
        }
    }

    #[test]
    fn round_share_of_missing_address_is_zero() {
        let b = block();
        let other = Address::parse("tos1zzzzzzzzzzzzzzzzzzzzzzzzzzzz").unwrap();
        assert_eq!(b.round_share_of(&other), 0.0);
    }

    #[test]
    fn round_share_of_present_address() {
        let b = block();
        let addr = b.finder_address.clone();
        assert_eq!(b.round_share_of(&addr), 42.0);
    }
}
