//! Persistence layer for the TOS mining pool.
//!
//! Every operation that touches more than one key must be issued as a
//! single atomic group (spec §4.2); callers never see a half-applied
//! WriteBlock or MoveBlockToMatured.

pub mod keys;
pub mod memory_store;
pub mod redis_store;

use async_trait::async_trait;
use thiserror::Error;
use tos_pool_core::{Block, Miner, Payment, Share};

pub use memory_store::MemoryStorage;
pub use redis_store::RedisStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock not held by this process")]
    LockNotHeld,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything the pool persists, behind one trait so the Redis-backed
/// production implementation and the in-memory test implementation can be
/// swapped without touching callers (spec §4.2).
#[async_trait]
pub trait Storage: Send + Sync {
    /// WriteShare: bump the round-share counter, append a hashrate
    /// sample, stamp lastShare/lastSeen. One atomic group.
    async fn write_share(&self, share: &Share) -> Result<(), StorageError>;

    /// WriteBlock: snapshot the current round-share map onto a new
    /// block record, clear round-shares, file the block under
    /// Candidates, bump finder + global counters. Returns the finalized
    /// Block (with its round-share snapshot populated).
    #[allow(clippy::too_many_arguments)]
    async fn write_block(
        &self,
        height: u64,
        hash: &str,
        finder_address: &tos_pool_core::Address,
        finder_worker: &str,
        declared_reward: u64,
        now: u64,
    ) -> Result<Block, StorageError>;

    async fn get_block(&self, hash: &str) -> Result<Option<Block>, StorageError>;

    async fn list_candidates(&self) -> Result<Vec<Block>, StorageError>;
    async fn list_immature(&self) -> Result<Vec<Block>, StorageError>;

    /// Candidate -> Immature, crediting each address's snapshot share
    /// into `immature` proportionally (spec §4.6/§4.7).
    async fn move_block_to_immature(&self, hash: &str, reward_splits: &[(tos_pool_core::Address, u64)]) -> Result<(), StorageError>;

    /// Immature -> Matured. Swaps `immature -> balance` for the same
    /// splits applied at the immature transition. Idempotent: calling
    /// this twice on an already-Matured block is a no-op (spec §8
    /// property 6).
    async fn move_block_to_matured(&self, hash: &str, reward_splits: &[(tos_pool_core::Address, u64)]) -> Result<(), StorageError>;

    /// Reverses only the credits that were actually applied: no-op if
    /// the block never left Candidate.
    async fn move_block_to_orphan(&self, hash: &str, reward_splits: &[(tos_pool_core::Address, u64)]) -> Result<(), StorageError>;

    async fn get_miner(&self, address: &tos_pool_core::Address) -> Result<Miner, StorageError>;
    async fn miners_above_threshold(&self, threshold: u64) -> Result<Vec<Miner>, StorageError>;

    async fn record_worker_last_seen(&self, address: &tos_pool_core::Address, worker: &str, now: u64) -> Result<(), StorageError>;

    /// Atomically moves `amount` from balance to pending and files a
    /// Pending Payment record (spec §4.8 step 5a).
    async fn reserve_payout(&self, payment: &Payment) -> Result<(), StorageError>;

    /// Pending -> Confirmed: settle the reservation, bump totalPaid
    /// (spec §4.8 step 5c).
    async fn confirm_payout(&self, payment_id: &str, tx_hash: &str) -> Result<(), StorageError>;

    /// Pending -> rolled back: return the reservation to balance and
    /// delete the pending record (spec §4.8 step 5d).
    async fn fail_payout(&self, payment_id: &str) -> Result<(), StorageError>;

    async fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError>;

    /// Appends a confirmed payment to the durable history list (spec §4.2,
    /// §4.8 step 5c "append to history"). Called by `confirm_payout`
    /// implementations, not by callers directly.
    async fn record_payment_history(&self, payment: &Payment) -> Result<(), StorageError>;

    /// Most recent confirmed payments first.
    async fn list_payment_history(&self, limit: usize) -> Result<Vec<Payment>, StorageError>;

    /// `SetIfAbsent(lockKey, lockID, ttl)` (spec §4.2).
    async fn acquire_payout_lock(&self, lock_id: &str, ttl_secs: u64) -> Result<bool, StorageError>;

    /// Compare-and-delete against `lock_id`; never releases a lock held
    /// by someone else.
    async fn release_payout_lock(&self, lock_id: &str) -> Result<(), StorageError>;

    /// Σ(difficulty) of hashrate samples for `address` within the last
    /// `window_secs`, divided by the window (spec §4.2).
    async fn hashrate(&self, address: &tos_pool_core::Address, window_secs: u64, now: u64) -> Result<f64, StorageError>;

    /// Removes hashrate samples older than the widest window any caller
    /// cares about.
    async fn purge_hashrate(&self, older_than_secs: u64, now: u64) -> Result<u64, StorageError>;

    async fn is_blacklisted(&self, address: &tos_pool_core::Address) -> Result<bool, StorageError>;
    async fn blacklist(&self, address: &tos_pool_core::Address) -> Result<(), StorageError>;
    async fn unblacklist(&self, address: &tos_pool_core::Address) -> Result<(), StorageError>;

    /// Whitelist entries are independent of the blacklist (spec §6 "add/remove
    /// blacklist and whitelist entries"); this pool doesn't enforce
    /// whitelist-only mode itself, it just persists the set for operators to
    /// query and mutate through the admin surface.
    async fn is_whitelisted(&self, address: &tos_pool_core::Address) -> Result<bool, StorageError>;
    async fn whitelist(&self, address: &tos_pool_core::Address) -> Result<(), StorageError>;
    async fn unwhitelist(&self, address: &tos_pool_core::Address) -> Result<(), StorageError>;
}
