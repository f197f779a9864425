//! In-memory `Storage` implementation. Used in tests and local/dev runs
//! where standing up Redis isn't worth it; production deployments use
//! [`crate::redis_store::RedisStorage`].

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tos_pool_core::{Address, Block, BlockStatus, Miner, Payment, PaymentStatus, Share};
use tracing::warn;

use crate::{Storage, StorageError};

#[derive(Default)]
struct State {
    miners: HashMap<Address, Miner>,
    worker_last_seen: HashMap<(Address, String), u64>,
    round_shares: HashMap<Address, f64>,
    blocks: HashMap<String, Block>,
    hashrate_samples: HashMap<Address, Vec<(u64, f64)>>,
    pending_payments: HashMap<String, Payment>,
    payment_history: Vec<Payment>,
    payout_lock: Option<(String, u64)>,
    blacklist: std::collections::HashSet<Address>,
    whitelist: std::collections::HashSet<Address>,
    blocks_found_total: u64,
}

pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage {
            state: Mutex::new(State::default()),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write_share(&self, share: &Share) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        *st.round_shares.entry(share.address.clone()).or_insert(0.0) += share.difficulty;

        st.hashrate_samples
            .entry(share.address.clone())
            .or_default()
            .push((share.timestamp, share.difficulty));

        let miner = st
            .miners
            .entry(share.address.clone())
            .or_insert_with(|| Miner::new(share.address.clone()));
        miner.last_share_at = share.timestamp;

        st.worker_last_seen
            .insert((share.address.clone(), share.worker.clone()), share.timestamp);

        Ok(())
    }

    async fn write_block(
        &self,
        height: u64,
        hash: &str,
        finder_address: &Address,
        finder_worker: &str,
        declared_reward: u64,
        now: u64,
    ) -> Result<Block, StorageError> {
        let mut st = self.state.lock().await;
        let round_shares = std::mem::take(&mut st.round_shares);
        let total = round_shares.values().sum();

        if let Some(m) = st.miners.get_mut(finder_address) {
            m.blocks_found += 1;
        }
        st.blocks_found_total += 1;

        let block = Block {
            height,
            hash: hash.to_string(),
            finder_address: finder_address.clone(),
            finder_worker: finder_worker.to_string(),
            declared_reward,
            round_shares,
            round_shares_total: total,
            status: BlockStatus::Candidate,
            confirmations: 0,
            discovered_at: now,
            immature_credited: false,
        };
        st.blocks.insert(hash.to_string(), block.clone());
        Ok(block)
    }

    async fn get_block(&self, hash: &str) -> Result<Option<Block>, StorageError> {
        Ok(self.state.lock().await.blocks.get(hash).cloned())
    }

    async fn list_candidates(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .blocks
            .values()
            .filter(|b| b.status == BlockStatus::Candidate)
            .cloned()
            .collect())
    }

    async fn list_immature(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .blocks
            .values()
            .filter(|b| b.status == BlockStatus::Immature)
            .cloned()
            .collect())
    }

    async fn move_block_to_immature(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let block = st
            .blocks
            .get_mut(hash)
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;

        if block.status != BlockStatus::Candidate {
            return Ok(());
        }
        block.status = BlockStatus::Immature;
        block.immature_credited = true;

        for (addr, amount) in reward_splits {
            st.miners
                .entry(addr.clone())
                .or_insert_with(|| Miner::new(addr.clone()))
                .credit_immature(*amount);
        }
        Ok(())
    }

    async fn move_block_to_matured(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let block = st
            .blocks
            .get_mut(hash)
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;

        if block.status != BlockStatus::Immature {
            // Idempotent: already matured (or never reached immature), nothing to do.
            return Ok(());
        }
        block.status = BlockStatus::Matured;

        for (addr, amount) in reward_splits {
            if let Some(m) = st.miners.get_mut(addr) {
                m.mature(*amount);
            }
        }
        Ok(())
    }

    async fn move_block_to_orphan(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let block = st
            .blocks
            .get_mut(hash)
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;

        let was_credited = block.immature_credited;
        block.status = BlockStatus::Orphan;

        if was_credited {
            for (addr, amount) in reward_splits {
                if let Some(m) = st.miners.get_mut(addr) {
                    m.reverse_immature(*amount);
                }
            }
        } else {
            warn!(hash, "orphaning a block that never reached immature, no reversal needed");
        }
        Ok(())
    }

    async fn get_miner(&self, address: &Address) -> Result<Miner, StorageError> {
        let mut st = self.state.lock().await;
        Ok(st
            .miners
            .entry(address.clone())
            .or_insert_with(|| Miner::new(address.clone()))
            .clone())
    }

    async fn miners_above_threshold(&self, threshold: u64) -> Result<Vec<Miner>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .miners
            .values()
            .filter(|m| m.balance >= threshold)
            .cloned()
            .collect())
    }

    async fn record_worker_last_seen(&self, address: &Address, worker: &str, now: u64) -> Result<(), StorageError> {
        self.state
            .lock()
            .await
            .worker_last_seen
            .insert((address.clone(), worker.to_string()), now);
        Ok(())
    }

    async fn reserve_payout(&self, payment: &Payment) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let miner = st
            .miners
            .get_mut(&payment.address)
            .ok_or_else(|| StorageError::NotFound(payment.address.to_string()))?;
        miner
            .reserve_for_payout(payment.amount)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        st.pending_payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn confirm_payout(&self, payment_id: &str, tx_hash: &str) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let mut payment = st
            .pending_payments
            .remove(payment_id)
            .ok_or_else(|| StorageError::NotFound(payment_id.to_string()))?;
        payment.mark_confirmed(tx_hash.to_string());

        if let Some(m) = st.miners.get_mut(&payment.address) {
            m.confirm_payout(payment.amount);
        }
        st.payment_history.push(payment);
        Ok(())
    }

    async fn fail_payout(&self, payment_id: &str) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        let payment = st
            .pending_payments
            .remove(payment_id)
            .ok_or_else(|| StorageError::NotFound(payment_id.to_string()))?;

        if let Some(m) = st.miners.get_mut(&payment.address) {
            m.release_payout(payment.amount);
        }
        Ok(())
    }

    async fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        Ok(self.state.lock().await.pending_payments.values().cloned().collect())
    }

    async fn record_payment_history(&self, payment: &Payment) -> Result<(), StorageError> {
        self.state.lock().await.payment_history.push(payment.clone());
        Ok(())
    }

    async fn list_payment_history(&self, limit: usize) -> Result<Vec<Payment>, StorageError> {
        let st = self.state.lock().await;
        Ok(st.payment_history.iter().rev().take(limit).cloned().collect())
    }

    async fn acquire_payout_lock(&self, lock_id: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let mut st = self.state.lock().await;
        if st.payout_lock.is_some() {
            return Ok(false);
        }
        st.payout_lock = Some((lock_id.to_string(), ttl_secs));
        Ok(true)
    }

    async fn release_payout_lock(&self, lock_id: &str) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        match &st.payout_lock {
            Some((held_by, _)) if held_by == lock_id => {
                st.payout_lock = None;
                Ok(())
            }
            Some(_) => Err(StorageError::LockNotHeld),
            None => Ok(()),
        }
    }

    async fn hashrate(&self, address: &Address, window_secs: u64, now: u64) -> Result<f64, StorageError> {
        let st = self.state.lock().await;
        let cutoff = now.saturating_sub(window_secs);
        let sum: f64 = st
            .hashrate_samples
            .get(address)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|(ts, _)| *ts >= cutoff)
                    .map(|(_, d)| d)
                    .sum()
            })
            .unwrap_or(0.0);
        Ok(sum / window_secs as f64)
    }

    async fn purge_hashrate(&self, older_than_secs: u64, now: u64) -> Result<u64, StorageError> {
        let mut st = self.state.lock().await;
        let cutoff = now.saturating_sub(older_than_secs);
        let mut purged = 0u64;
        for samples in st.hashrate_samples.values_mut() {
            let before = samples.len();
            samples.retain(|(ts, _)| *ts >= cutoff);
            purged += (before - samples.len()) as u64;
        }
        Ok(purged)
    }

    async fn is_blacklisted(&self, address: &Address) -> Result<bool, StorageError> {
        Ok(self.state.lock().await.blacklist.contains(address))
    }

    async fn blacklist(&self, address: &Address) -> Result<(), StorageError> {
        self.state.lock().await.blacklist.insert(address.clone());
        Ok(())
    }

    async fn unblacklist(&self, address: &Address) -> Result<(), StorageError> {
        self.state.lock().await.blacklist.remove(address);
        Ok(())
    }

    async fn is_whitelisted(&self, address: &Address) -> Result<bool, StorageError> {
        Ok(self.state.lock().await.whitelist.contains(address))
    }

    async fn whitelist(&self, address: &Address) -> Result<(), StorageError> {
        self.state.lock().await.whitelist.insert(address.clone());
        Ok(())
    }

    async fn unwhitelist(&self, address: &Address) -> Result<(), StorageError> {
        self.state.lock().await.whitelist.remove(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_pool_core::Address;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn share(address: Address, difficulty: f64, timestamp: u64) -> Share {
        Share {
            session_id: 1,
            address,
            worker: "rig1".into(),
            job_id: "job-1".into(),
            nonce: 42,
            hash_hex: "ab01".into(),
            difficulty,
            height: 10,
            timestamp,
            is_block: false,
        }
    }

    #[tokio::test]
    async fn write_block_snapshots_and_clears_round_shares() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = addr("tos1bbbbbbbbbbbbbbbbbbbbbbbbbbbb");

        store.write_share(&share(a.clone(), 600_000.0, 1000)).await.unwrap();
        store.write_share(&share(b.clone(), 400_000.0, 1001)).await.unwrap();

        let block = store
            .write_block(100, "blockhash1", &a, "rig1", 10_000_000_000, 1002)
            .await
            .unwrap();

        assert_eq!(block.round_shares_total, 1_000_000.0);
        assert_eq!(block.round_share_of(&a), 600_000.0);

        let next = store
            .write_block(101, "blockhash2", &a, "rig1", 10_000_000_000, 1003)
            .await
            .unwrap();
        assert_eq!(next.round_shares_total, 0.0);
    }

    #[tokio::test]
    async fn matured_twice_is_idempotent() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        store.write_share(&share(a.clone(), 1_000_000.0, 1000)).await.unwrap();
        store.write_block(100, "h1", &a, "rig1", 10_000_000_000, 1001).await.unwrap();

        let splits = vec![(a.clone(), 9_900_000_000u64)];
        store.move_block_to_immature("h1", &splits).await.unwrap();
        store.move_block_to_matured("h1", &splits).await.unwrap();
        let balance_after_first = store.get_miner(&a).await.unwrap().balance;

        store.move_block_to_matured("h1", &splits).await.unwrap();
        let balance_after_second = store.get_miner(&a).await.unwrap().balance;

        assert_eq!(balance_after_first, balance_after_second);
        assert_eq!(balance_after_first, 9_900_000_000);
    }

    #[tokio::test]
    async fn orphan_without_immature_credit_does_not_touch_balance() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        store.write_share(&share(a.clone(), 1_000_000.0, 1000)).await.unwrap();
        store.write_block(100, "h1", &a, "rig1", 10_000_000_000, 1001).await.unwrap();

        store.move_block_to_orphan("h1", &[(a.clone(), 9_900_000_000)]).await.unwrap();
        assert_eq!(store.get_miner(&a).await.unwrap().immature, 0);
    }

    #[tokio::test]
    async fn payout_lock_is_exclusive_and_compare_and_delete() {
        let store = MemoryStorage::new();
        assert!(store.acquire_payout_lock("run-a", 30).await.unwrap());
        assert!(!store.acquire_payout_lock("run-b", 30).await.unwrap());
        assert!(matches!(
            store.release_payout_lock("run-b").await,
            Err(StorageError::LockNotHeld)
        ));
        store.release_payout_lock("run-a").await.unwrap();
        assert!(store.acquire_payout_lock("run-b", 30).await.unwrap());
    }

    #[tokio::test]
    async fn failed_payout_returns_funds_to_balance() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        store.get_miner(&a).await.unwrap();
        {
            let mut st = store.state.lock().await;
            st.miners.get_mut(&a).unwrap().balance = 100;
        }
        let payment = Payment::new("pay-1".into(), a.clone(), 100, 1000);
        store.reserve_payout(&payment).await.unwrap();
        assert_eq!(store.get_miner(&a).await.unwrap().balance, 0);

        store.fail_payout("pay-1").await.unwrap();
        assert_eq!(store.get_miner(&a).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn confirmed_payout_is_appended_to_history_and_removed_from_pending() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        {
            let mut st = store.state.lock().await;
            st.miners.entry(a.clone()).or_insert_with(|| Miner::new(a.clone())).balance = 100;
        }
        let payment = Payment::new("pay-1".into(), a.clone(), 100, 1000);
        store.reserve_payout(&payment).await.unwrap();
        store.confirm_payout("pay-1", "txhash").await.unwrap();

        assert!(store.list_pending_payments().await.unwrap().is_empty());
        let history = store.list_payment_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "pay-1");
        assert_eq!(history[0].tx_hash.as_deref(), Some("txhash"));
    }

    #[tokio::test]
    async fn blacklist_and_whitelist_are_independent_sets() {
        let store = MemoryStorage::new();
        let a = addr("tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        assert!(!store.is_blacklisted(&a).await.unwrap());
        assert!(!store.is_whitelisted(&a).await.unwrap());

        store.blacklist(&a).await.unwrap();
        assert!(store.is_blacklisted(&a).await.unwrap());
        assert!(!store.is_whitelisted(&a).await.unwrap());

        store.whitelist(&a).await.unwrap();
        assert!(store.is_blacklisted(&a).await.unwrap());
        assert!(store.is_whitelisted(&a).await.unwrap());

        store.unblacklist(&a).await.unwrap();
        assert!(!store.is_blacklisted(&a).await.unwrap());
        assert!(store.is_whitelisted(&a).await.unwrap());

        store.unwhitelist(&a).await.unwrap();
        assert!(!store.is_whitelisted(&a).await.unwrap());
    }
}
