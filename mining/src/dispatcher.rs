//! Job Dispatcher (C3): polls the active upstream for a block template and
//! mints new jobs on header/height/target change or refresh deadline
//! (spec §4.3).

use num_bigint::BigUint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tos_pool_core::{Job, Target};
use tos_pool_upstream::{CoordinatorError, RpcError, UpstreamCoordinator};
use tos_pool_validator::target_for_difficulty;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("upstream returned a malformed block template: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub job_refresh_interval: Duration,
    /// Hard ceiling on how long a job may be reused even with no upstream
    /// change, forcing miners off stale ntimes (spec §4.3 "refresh-deadline").
    pub job_max_age: Duration,
    /// Address the pool mines to; passed to `get_block_template`.
    pub pool_address: String,
    /// Algorithm-opaque difficulty-1 target (spec §9 open question a).
    pub max_target: Target,
}

/// Pushes each newly minted job to every subscriber; `watch` gives the
/// "atomic current-job reference" the design notes call for without a
/// read-write lock on the broadcast path (spec §9).
pub struct JobDispatcher {
    upstream: Arc<UpstreamCoordinator>,
    config: DispatcherConfig,
    tx: watch::Sender<Option<Arc<Job>>>,
    job_counter: AtomicU64,
}

impl JobDispatcher {
    pub fn new(upstream: Arc<UpstreamCoordinator>, config: DispatcherConfig) -> (Self, watch::Receiver<Option<Arc<Job>>>) {
        let (tx, rx) = watch::channel(None);
        (
            JobDispatcher {
                upstream,
                config,
                tx,
                job_counter: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Job>>> {
        self.tx.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.tx.borrow().clone()
    }

    /// Runs the poll loop until cancelled. Intended to be `tokio::spawn`ed
    /// by `main`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.job_refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(now_secs()).await {
                        warn!(error = %e, "job dispatcher poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self, now: u64) -> Result<(), DispatcherError> {
        let client = self.upstream.current_client().await?;
        let template = client.get_block_template(&self.config.pool_address).await?;

        let header_prefix = hex::decode(&template.template)
            .map_err(|e| DispatcherError::Malformed(format!("template is not valid hex: {e}")))?;

        let difficulty = parse_decimal_saturating(&template.difficulty)
            .ok_or_else(|| DispatcherError::Malformed(format!("unparseable difficulty {:?}", template.difficulty)))?;

        let current = self.tx.borrow().clone();
        let height_changed = current.as_ref().map(|j| j.height) != Some(template.height);
        let header_changed = current.as_ref().map(|j| &j.header_prefix) != Some(&header_prefix);
        let deadline_passed = current
            .as_ref()
            .map(|j| now.saturating_sub(j.created_at) >= self.config.job_max_age.as_secs())
            .unwrap_or(true);

        if !height_changed && !header_changed && !deadline_passed {
            return Ok(());
        }

        let target = target_for_difficulty(&self.config.max_target, difficulty);
        let id = self.job_counter.fetch_add(1, Ordering::Relaxed);

        let job = Arc::new(Job {
            id: format!("{id:016x}"),
            height: template.height,
            header_prefix,
            target,
            difficulty,
            clean_jobs: height_changed,
            created_at: now,
            opaque_template: Some(template.template.into_bytes()),
        });

        debug!(job_id = %job.id, height = job.height, clean_jobs = job.clean_jobs, "minted new job");
        if self.tx.send(Some(job)).is_err() {
            error!("job dispatcher has no subscribers left");
        }

        Ok(())
    }
}

fn parse_decimal_saturating(s: &str) -> Option<u64> {
    let big = s.parse::<BigUint>().ok()?;
    let bytes = big.to_bytes_be();
    if bytes.len() > 8 {
        return Some(u64::MAX);
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(&bytes);
    Some(u64::from_be_bytes(buf))
}

fn now_secs() -> u64 {
    tos_pool_util::now_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimal_difficulty() {
        assert_eq!(parse_decimal_saturating("1000000"), Some(1_000_000));
    }

    #[test]
    fn saturates_huge_difficulty_to_u64_max() {
        let huge = "9".repeat(40);
        assert_eq!(parse_decimal_saturating(&huge), Some(u64::MAX));
    }

    #[test]
    fn rejects_non_numeric_difficulty() {
        assert!(parse_decimal_saturating("not-a-number").is_none());
    }
}
