//! Payout Engine (C8): threshold-based batch payouts with idempotent
//! locking, rollback, and wallet reconciliation (spec §4.8).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tos_pool_core::{Payment, PaymentStatus};
use tos_pool_storage::{Storage, StorageError};
use tos_pool_wallet::{Destination, WalletClient, WalletError};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub threshold: u64,
    pub withdrawal_fee_fixed: u64,
    pub withdrawal_fee_rate: f64,
    pub max_addresses_per_tx: usize,
    pub lock_ttl_secs: u64,
    pub wallet_max_attempts: u32,
    /// How long a pending payment with no known tx hash may sit before
    /// crash-recovery rolls it back (spec §4.8 "Crash recovery").
    pub reconcile_grace_secs: u64,
}

#[derive(Debug, Default, Clone)]
pub struct PayoutRunSummary {
    pub paid_miners: u64,
    pub paid_amount: u64,
    pub failed_batches: u64,
    pub skipped_below_threshold_to_net_zero: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileSummary {
    pub confirmed: u64,
    pub rolled_back: u64,
    pub still_pending: u64,
}

/// Read-only status snapshot for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PayoutEngineStatus {
    pub last_run_paid_miners: u64,
    pub last_run_paid_amount: u64,
    pub degraded: bool,
}

pub struct PayoutEngine {
    storage: Arc<dyn Storage>,
    wallet: Arc<WalletClient>,
    config: PayoutConfig,
    last_run_paid_miners: AtomicU64,
    last_run_paid_amount: AtomicU64,
    degraded: AtomicBool,
}

impl PayoutEngine {
    pub fn new(storage: Arc<dyn Storage>, wallet: Arc<WalletClient>, config: PayoutConfig) -> Self {
        PayoutEngine {
            storage,
            wallet,
            config,
            last_run_paid_miners: AtomicU64::new(0),
            last_run_paid_amount: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// Read-only snapshot for the admin surface (spec §6 "view pending
    /// payouts"); updated after every `run_once`.
    pub fn status(&self) -> PayoutEngineStatus {
        PayoutEngineStatus {
            last_run_paid_miners: self.last_run_paid_miners.load(Ordering::Relaxed),
            last_run_paid_amount: self.last_run_paid_amount.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    fn net_amount(&self, balance: u64) -> u64 {
        net_amount(balance, self.config.withdrawal_fee_fixed, self.config.withdrawal_fee_rate)
    }

    /// One payout cycle (spec §4.8 steps 1-6). Returns `None` if the lock
    /// could not be acquired — that's expected under concurrent runs and is
    /// a silent skip (spec §7 "Lock acquisition failure").
    pub async fn run_once(&self, now: u64) -> Result<Option<PayoutRunSummary>, PayoutError> {
        let lock_id = format!("{}-{}", now, std::process::id());
        if !self.storage.acquire_payout_lock(&lock_id, self.config.lock_ttl_secs).await? {
            return Ok(None);
        }

        let result = self.run_locked(now).await;

        if let Err(e) = self.storage.release_payout_lock(&lock_id).await {
            warn!(error = %e, "failed to release payout lock");
        }

        if let Ok(summary) = &result {
            self.last_run_paid_miners.store(summary.paid_miners, Ordering::Relaxed);
            self.last_run_paid_amount.store(summary.paid_amount, Ordering::Relaxed);
            self.degraded.store(summary.failed_batches > 0, Ordering::Relaxed);
        }

        result.map(Some)
    }

    async fn run_locked(&self, now: u64) -> Result<PayoutRunSummary, PayoutError> {
        let miners = self.storage.miners_above_threshold(self.config.threshold).await?;
        let mut summary = PayoutRunSummary::default();

        let mut recipients = Vec::new();
        for miner in miners {
            let net = self.net_amount(miner.balance);
            if net == 0 {
                summary.skipped_below_threshold_to_net_zero += 1;
                continue;
            }
            recipients.push((miner.address, net));
        }

        for batch in recipients.chunks(self.config.max_addresses_per_tx.max(1)) {
            match self.run_batch(batch, now).await {
                Ok(paid) => {
                    summary.paid_miners += paid.len() as u64;
                    summary.paid_amount += paid.iter().map(|(_, amount)| amount).sum::<u64>();
                }
                Err(e) => {
                    warn!(error = %e, "payout batch failed");
                    summary.failed_batches += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn run_batch(&self, batch: &[(tos_pool_core::Address, u64)], now: u64) -> Result<Vec<(tos_pool_core::Address, u64)>, PayoutError> {
        let mut payments = Vec::with_capacity(batch.len());
        for (address, amount) in batch {
            let payment_id = format!("pend-{}-{}-{}", now, std::process::id(), address.as_str());
            let payment = Payment::new(payment_id, address.clone(), *amount, now);
            self.storage.reserve_payout(&payment).await?;
            payments.push(payment);
        }

        let destinations: Vec<Destination> = payments
            .iter()
            .map(|p| Destination { address: p.address.as_str().to_string(), amount: p.amount, asset: None })
            .collect();

        match self.wallet.transfer_with_retry(&destinations, true, self.config.wallet_max_attempts).await {
            Ok(tx_hash) => {
                for payment in &payments {
                    self.storage.confirm_payout(&payment.id, &tx_hash).await?;
                }
                info!(tx_hash = %tx_hash, count = payments.len(), "payout batch confirmed");
                Ok(payments.into_iter().map(|p| (p.address, p.amount)).collect())
            }
            Err(e) => {
                for payment in &payments {
                    self.storage.fail_payout(&payment.id).await?;
                }
                Err(PayoutError::Wallet(e))
            }
        }
    }

    /// Crash recovery (spec §4.8 "Crash recovery"). A pending payment that
    /// already carries a `tx_hash` means the process crashed after the
    /// wallet accepted the transfer but before the confirm was recorded —
    /// complete it directly. One with no `tx_hash` past the grace window
    /// means the wallet call itself never resolved; roll it back rather
    /// than risk a second transfer against an unknown outcome.
    pub async fn reconcile_on_startup(&self, now: u64) -> Result<ReconcileSummary, PayoutError> {
        let pending = self.storage.list_pending_payments().await?;
        let mut summary = ReconcileSummary::default();

        for payment in pending {
            if payment.status != PaymentStatus::Pending {
                continue;
            }
            match &payment.tx_hash {
                Some(tx_hash) => {
                    self.storage.confirm_payout(&payment.id, tx_hash).await?;
                    summary.confirmed += 1;
                }
                None if now.saturating_sub(payment.created_at) >= self.config.reconcile_grace_secs => {
                    self.storage.fail_payout(&payment.id).await?;
                    summary.rolled_back += 1;
                }
                None => summary.still_pending += 1,
            }
        }

        Ok(summary)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn net_amount(balance: u64, fixed_fee: u64, rate_fee: f64) -> u64 {
    let fee = fixed_fee + (balance as f64 * rate_fee) as u64;
    balance.saturating_sub(fee)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_amount_deducts_fixed_fee() {
        // spec §8 E6: balance 250_000_000, withdrawal_fee 1_000_000.
        assert_eq!(net_amount(250_000_000, 1_000_000, 0.0), 249_000_000);
    }

    #[test]
    fn net_amount_deducts_rate_fee() {
        assert_eq!(net_amount(1_000_000, 0, 0.01), 990_000);
    }

    #[test]
    fn net_amount_saturates_at_zero_when_fee_exceeds_balance() {
        assert_eq!(net_amount(500, 1_000, 0.0), 0);
    }
}
