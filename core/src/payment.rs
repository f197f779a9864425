//! Payment (P): a single payout engine attempt against one address.

use crate::address::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Synthetic id assigned at creation time, independent of `tx_hash`
    /// (which is only known once the wallet accepts the transfer).
    pub id: String,

    pub address: Address,
    pub amount: u64,

    /// Set once the wallet returns a transaction hash; absent while
    /// `status == Pending` and the wallet call is still in flight.
    pub tx_hash: Option<String>,

    pub status: PaymentStatus,
    pub created_at: u64,
    pub attempts: u32,
}

impl Payment {
    pub fn new(id: String, address: Address, amount: u64, now: u64) -> Self {
        Payment {
            id,
            address,
            amount,
            tx_hash: None,
            status: PaymentStatus::Pending,
            created_at: now,
            attempts: 0,
        }
    }

    pub fn mark_confirmed(&mut self, tx_hash: String) {
        self.tx_hash = Some(tx_hash);
        self.status = PaymentStatus::Confirmed;
    }

    pub fn mark_failed(&mut self) {
        self.status = PaymentStatus::Failed;
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_payment_is_pending_with_no_tx_hash() {
        let a = Address::parse("tos1qqqqqqqqqqqqqqqqqqqqqqqqqqqq").unwrap();
        let p = Payment::new("pay-1".into(), a, 100, 1000);
        assert_eq!(p.status, PaymentStatus::Pending);
        assert!(p.tx_hash.is_none());
    }

    #[test]
    fn mark_confirmed_sets_tx_hash() {
        let a = Address::parse("tos1qqqqqqqqqqqqqqqqqqqqqqqqqqqq").unwrap();
        let mut p = Payment::new("pay-1".into(), a, 100, 1000);
        p.mark_confirmed("deadbeef".into());
        assert_eq!(p.status, PaymentStatus::Confirmed);
        assert_eq!(p.tx_hash.as_deref(), Some("deadbeef"));
    }
}
