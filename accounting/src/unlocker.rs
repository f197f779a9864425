//! Block Unlocker (C6): walks Candidate and Immature blocks forward as
//! chain height advances (spec §4.6).

use crate::pplns::compute_reward_splits;
use std::sync::Arc;
use thiserror::Error;
use tos_pool_core::{Address, Block};
use tos_pool_storage::{Storage, StorageError};
use tos_pool_upstream::{CoordinatorError, RpcError, UpstreamCoordinator};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UnlockerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Clone)]
pub struct UnlockerConfig {
    /// Confirmations required before a Candidate is even looked at again.
    pub immature_depth: u64,
    /// Confirmations required before an Immature block is eligible to
    /// mature.
    pub mature_depth: u64,
    /// How many topoheights on either side of a block's recorded height to
    /// search when re-verifying on-chain presence at maturity, to tolerate
    /// minor reorgs (spec §4.6 step 3).
    pub reorg_check_window: u64,
    pub pool_fee_percent: f64,
    pub fee_address: Address,
}

#[derive(Debug, Default, Clone)]
pub struct UnlockerSummary {
    pub moved_to_immature: u64,
    pub moved_to_matured: u64,
    pub moved_to_orphan: u64,
    pub skipped: u64,
}

pub struct BlockUnlocker {
    storage: Arc<dyn Storage>,
    upstream: Arc<UpstreamCoordinator>,
    config: UnlockerConfig,
}

impl BlockUnlocker {
    pub fn new(storage: Arc<dyn Storage>, upstream: Arc<UpstreamCoordinator>, config: UnlockerConfig) -> Self {
        BlockUnlocker { storage, upstream, config }
    }

    pub async fn run_once(&self) -> Result<UnlockerSummary, UnlockerError> {
        let top = self.upstream.current_client().await?.get_top_block(false).await?;
        let current_topoheight = top.topoheight;

        let mut summary = UnlockerSummary::default();

        for block in self.storage.list_candidates().await? {
            self.process_candidate(&block, current_topoheight, &mut summary).await?;
        }
        for block in self.storage.list_immature().await? {
            self.process_immature(&block, current_topoheight, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn process_candidate(&self, block: &Block, current_topoheight: u64, summary: &mut UnlockerSummary) -> Result<(), UnlockerError> {
        let confirmations = current_topoheight.saturating_sub(block.height);
        if confirmations < self.config.immature_depth {
            summary.skipped += 1;
            return Ok(());
        }

        let client = self.upstream.current_client().await?;
        let on_chain = match client.get_block_at_topoheight(block.height, false).await {
            Ok(found) => found.hash == block.hash,
            Err(_) => false,
        };

        let splits = self.reward_splits(block);
        if on_chain {
            self.storage.move_block_to_immature(&block.hash, &splits).await?;
            summary.moved_to_immature += 1;
            info!(hash = %block.hash, height = block.height, "block moved Candidate -> Immature");
        } else {
            self.storage.move_block_to_orphan(&block.hash, &splits).await?;
            summary.moved_to_orphan += 1;
            warn!(hash = %block.hash, height = block.height, "candidate block not found on-chain, orphaned");
        }
        Ok(())
    }

    async fn process_immature(&self, block: &Block, current_topoheight: u64, summary: &mut UnlockerSummary) -> Result<(), UnlockerError> {
        let confirmations = current_topoheight.saturating_sub(block.height);
        if confirmations < self.config.mature_depth {
            summary.skipped += 1;
            return Ok(());
        }

        let client = self.upstream.current_client().await?;
        let on_chain = self.verify_on_chain_within_window(block, client).await;

        let splits = self.reward_splits(block);
        if on_chain {
            self.storage.move_block_to_matured(&block.hash, &splits).await?;
            summary.moved_to_matured += 1;
            info!(hash = %block.hash, height = block.height, "block moved Immature -> Matured");
        } else {
            self.storage.move_block_to_orphan(&block.hash, &splits).await?;
            summary.moved_to_orphan += 1;
            warn!(hash = %block.hash, height = block.height, "immature block dropped out of chain, orphaned");
        }
        Ok(())
    }

    async fn verify_on_chain_within_window(&self, block: &Block, client: &tos_pool_upstream::RpcClient) -> bool {
        let window = self.config.reorg_check_window;
        let lo = block.height.saturating_sub(window);
        let hi = block.height + window;
        for height in lo..=hi {
            if let Ok(found) = client.get_block_at_topoheight(height, false).await {
                if found.hash == block.hash {
                    return true;
                }
            }
        }
        false
    }

    fn reward_splits(&self, block: &Block) -> Vec<(Address, u64)> {
        compute_reward_splits(
            &block.round_shares,
            block.round_shares_total,
            block.declared_reward,
            self.config.pool_fee_percent,
            &self.config.fee_address,
        )
    }
}
