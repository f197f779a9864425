//! Miner (M): a payout address's aggregate ledger.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MinerError {
    #[error("insufficient confirmed balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },
}

/// Per-address accounting state. Field names mirror spec §3 verbatim.
///
/// Invariant (spec §8.1, balance conservation): at all times
/// `balance + immature + pending <= sum(credits) - sum(paid)` holds with
/// equality once all in-flight moves settle; `balance` never goes negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Miner {
    pub address: Address,

    /// Confirmed, payable balance.
    pub balance: u64,

    /// Credited from a block not yet matured; moves to `balance` on
    /// maturity, or is reversed on orphan (spec §4.6).
    pub immature: u64,

    /// Debited from `balance` once a payout batch has been submitted to
    /// the wallet but not yet confirmed; moves to paid or back to balance
    /// depending on the wallet's outcome (spec §4.8).
    pub pending: u64,

    pub total_paid: u64,
    pub blocks_found: u64,
    pub last_share_at: u64,
}

impl Miner {
    pub fn new(address: Address) -> Self {
        Miner {
            address,
            balance: 0,
            immature: 0,
            pending: 0,
            total_paid: 0,
            blocks_found: 0,
            last_share_at: 0,
        }
    }

    pub fn credit_immature(&mut self, amount: u64) {
        self.immature += amount;
    }

    /// Moves a previously credited immature amount into the spendable
    /// balance (spec §4.6: block reaches maturity depth).
    pub fn mature(&mut self, amount: u64) {
        self.immature = self.immature.saturating_sub(amount);
        self.balance += amount;
    }

    /// Reverses an immature credit that was never matured (spec §4.6:
    /// orphan reversal, "reverse only the credits that were actually
    /// applied").
    pub fn reverse_immature(&mut self, amount: u64) {
        self.immature = self.immature.saturating_sub(amount);
    }

    /// Moves a payable amount into the in-flight payout bucket. Fails
    /// rather than letting `balance` go negative.
    pub fn reserve_for_payout(&mut self, amount: u64) -> Result<(), MinerError> {
        if self.balance < amount {
            return Err(MinerError::InsufficientBalance {
                have: self.balance,
                need: amount,
            });
        }
        self.balance -= amount;
        self.pending += amount;
        Ok(())
    }

    /// The wallet confirmed the transfer: settle the reservation.
    pub fn confirm_payout(&mut self, amount: u64) {
        self.pending = self.pending.saturating_sub(amount);
        self.total_paid += amount;
    }

    /// The wallet call failed permanently: return the reservation to the
    /// payable balance rather than losing it (spec §4.8 crash recovery).
    pub fn release_payout(&mut self, amount: u64) {
        self.pending = self.pending.saturating_sub(amount);
        self.balance += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner() -> Miner {
        Miner::new(Address::parse("tos1qqqqqqqqqqqqqqqqqqqqqqqqqqqq").unwrap())
    }

    #[test]
    fn mature_moves_immature_to_balance() {
        let mut m = miner();
        m.credit_immature(100);
        m.mature(100);
        assert_eq!(m.immature, 0);
        assert_eq!(m.balance, 100);
    }

    #[test]
    fn reserve_for_payout_rejects_insufficient_balance() {
        let mut m = miner();
        assert!(m.reserve_for_payout(10).is_err());
    }

    #[test]
    fn released_payout_returns_to_balance_not_lost() {
        let mut m = miner();
        m.balance = 50;
        m.reserve_for_payout(50).unwrap();
        assert_eq!(m.balance, 0);
        m.release_payout(50);
        assert_eq!(m.balance, 50);
        assert_eq!(m.pending, 0);
    }

    #[test]
    fn confirm_payout_accumulates_total_paid() {
        let mut m = miner();
        m.balance = 50;
        m.reserve_for_payout(50).unwrap();
        m.confirm_payout(50);
        assert_eq!(m.total_paid, 50);
        assert_eq!(m.pending, 0);
    }
}
