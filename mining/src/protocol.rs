//! Wire-agnostic core of the Session Manager contract (spec §4.5): the
//! parts of subscribe/authorize/submit that don't depend on framing. Each
//! protocol variant (Stratum, WebSocket-GetWork, Xatum) drives this with
//! its own listener loop and wire codec.

use crate::ban::BanRegistry;
use crate::session::{generate_extranonce1, new_session, SessionHandle, SessionTable};
use crate::vardiff::{self, VardiffConfig};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tos_pool_core::{Address, Job, SessionId, Share};
use tos_pool_storage::Storage;
use tos_pool_upstream::UpstreamCoordinator;
use tos_pool_util::now_secs;
use tos_pool_validator::{InvalidReason, ShareOutcome, ShareValidator, SubmitRequest};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    Invalid(InvalidReasonWire),
    Unauthorized,
    /// A sampled full-validation check failed on a session that was
    /// otherwise trust-skip eligible (spec §4.4, §7): trust is reset, the
    /// IP is banned, and the wire layer closes the connection.
    TrustViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidReasonWire {
    pub code: i32,
    pub message: &'static str,
}

pub enum SubmitResult {
    Accepted { is_block: bool },
    Rejected(SubmitError),
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub extranonce1_width: usize,
    pub extranonce2_size: usize,
    pub initial_difficulty: f64,
    pub stale_grace_secs: u64,
    pub trust_threshold: f64,
    pub trust_check_percent: u8,
    pub dup_tracker_capacity: usize,
    pub recent_jobs_kept: usize,
    pub vardiff: VardiffConfig,
    pub max_target: [u8; 32],
}

pub struct ProtocolHandler {
    pub config: ProtocolConfig,
    pub sessions: Arc<SessionTable>,
    pub bans: Arc<BanRegistry>,
    pub storage: Arc<dyn Storage>,
    pub upstream: Arc<UpstreamCoordinator>,
    validator: Mutex<ShareValidator>,
    recent_jobs: Mutex<VecDeque<Arc<Job>>>,
}

impl ProtocolHandler {
    pub fn new(
        config: ProtocolConfig,
        storage: Arc<dyn Storage>,
        bans: Arc<BanRegistry>,
        upstream: Arc<UpstreamCoordinator>,
        validator: ShareValidator,
    ) -> Self {
        ProtocolHandler {
            config,
            sessions: Arc::new(SessionTable::new()),
            bans,
            storage,
            upstream,
            validator: Mutex::new(validator),
            recent_jobs: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a newly accepted connection's session. Returns its id,
    /// the assigned extranonce1 and the session table handle.
    pub async fn accept_session(
        &self,
        peer_addr: std::net::SocketAddr,
    ) -> (SessionId, String, Arc<SessionHandle>, tokio::sync::mpsc::Receiver<String>) {
        let id = self.sessions.next_session_id();
        let extranonce1 = generate_extranonce1(self.config.extranonce1_width);
        let session = new_session(
            id,
            peer_addr,
            extranonce1.clone(),
            self.config.extranonce2_size,
            self.config.initial_difficulty,
            now_secs(),
        );
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let handle = Arc::new(SessionHandle { state: Mutex::new(session), outbound: tx });
        self.sessions.insert(id, handle.clone()).await;
        (id, extranonce1, handle, rx)
    }

    pub async fn remove_session(&self, id: SessionId, peer_ip: IpAddr) {
        self.sessions.remove(id).await;
        self.bans.release_connection(peer_ip);
    }

    /// Records a notify event so late submissions against this job's
    /// recent predecessors are still accepted within grace (spec §4.3).
    pub async fn note_new_job(&self, job: Arc<Job>) {
        let mut jobs = self.recent_jobs.lock().await;
        if job.clean_jobs {
            jobs.clear();
        }
        jobs.push_back(job);
        while jobs.len() > self.config.recent_jobs_kept {
            jobs.pop_front();
        }
    }

    pub async fn current_job(&self) -> Option<Arc<Job>> {
        self.recent_jobs.lock().await.back().cloned()
    }

    async fn resolve_job(&self, job_id: &str) -> (Option<Arc<Job>>, bool) {
        let jobs = self.recent_jobs.lock().await;
        let current = jobs.back();
        match jobs.iter().rev().find(|j| j.id == job_id) {
            None => (None, false),
            Some(job) => {
                let is_current = current.map(|c| c.id == job.id).unwrap_or(false);
                let superseded = !is_current && !job.is_within_grace(now_secs(), self.config.stale_grace_secs);
                (Some(job.clone()), superseded)
            }
        }
    }

    pub async fn authorize(
        &self,
        session: &Arc<SessionHandle>,
        worker_name: &str,
        now: u64,
    ) -> Result<(), ()> {
        let (address_str, worker) = tos_pool_core::address::split_worker_name(worker_name);
        let address = match Address::parse(address_str) {
            Ok(a) => a,
            Err(e) => {
                warn!(address = address_str, error = %e, "authorize rejected: malformed address");
                return Err(());
            }
        };

        match self.storage.is_blacklisted(&address).await {
            Ok(true) => {
                warn!(address = %address, "authorize rejected: blacklisted");
                return Err(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "storage error checking blacklist, rejecting authorize defensively");
                return Err(());
            }
        }

        let mut state = session.state.lock().await;
        state.authorized = Some(tos_pool_core::AuthorizedWorker { address: address.clone(), worker: worker.to_string() });
        state.last_share_at = now;
        info!(address = %address, worker, session_id = state.id, "worker authorized");
        Ok(())
    }

    /// Runs the full validate-and-account pipeline for a submit and
    /// updates session/ban/storage bookkeeping. Returns the outcome for the
    /// caller to translate into its wire response.
    pub async fn submit(
        &self,
        session: &Arc<SessionHandle>,
        peer_ip: IpAddr,
        job_id: &str,
        extranonce2_hex: &str,
        nonce_hex: &str,
        now: u64,
    ) -> SubmitResult {
        let (session_id, difficulty, address, worker) = {
            let state = session.state.lock().await;
            match &state.authorized {
                None => return SubmitResult::Rejected(SubmitError::Unauthorized),
                Some(worker) => (state.id, state.difficulty, worker.address.clone(), worker.worker.clone()),
            }
        };

        let (job, superseded) = self.resolve_job(job_id).await;
        let height = job.as_ref().map(|j| j.height).unwrap_or(0);

        let req = SubmitRequest {
            session_id,
            job: job.as_deref(),
            job_superseded: superseded,
            session_difficulty: difficulty,
            max_target: &self.config.max_target,
            nonce_hex,
            nonce_offset: job.as_ref().map(|j| nonce_offset(j)).unwrap_or(0),
            nonce_width: 8,
            extranonce2_hex: Some(extranonce2_hex),
            extranonce2_offset: job.as_ref().map(|j| extranonce2_offset(j)).unwrap_or(0),
            extranonce2_width: 4,
            trust_score: {
                let state = session.state.lock().await;
                state.trust_score
            },
            trust_threshold: self.config.trust_threshold,
            trust_check_percent: self.config.trust_check_percent,
        };

        let outcome = self.validator.lock().await.validate(req);

        match outcome {
            ShareOutcome::Invalid { reason, trust_violation: true } => {
                let mut state = session.state.lock().await;
                state.reset_trust();
                state.record_invalid_share(now);
                drop(state);
                self.bans.ban_for_flood(peer_ip, now);
                warn!(address = %address, worker, reason = ?reason, "trust violation: session sampled and failed full validation, closing");
                SubmitResult::Rejected(SubmitError::TrustViolation)
            }
            ShareOutcome::Invalid { reason, trust_violation: false } => {
                let mut state = session.state.lock().await;
                if reason == InvalidReason::Stale {
                    state.record_stale_share(now);
                } else {
                    state.record_invalid_share(now);
                }
                drop(state);
                self.bans.record_invalid(peer_ip, now);
                SubmitResult::Rejected(SubmitError::Invalid(InvalidReasonWire { code: reason.stratum_code(), message: reason.message() }))
            }
            ShareOutcome::Valid { difficulty: observed, hash } => {
                {
                    let mut state = session.state.lock().await;
                    state.record_valid_share(now);
                }
                self.bans.record_valid(peer_ip, now);
                self.record_share(session_id, &address, &worker, job_id, nonce_hex, hash, difficulty, height, now, false)
                    .await;
                let _ = observed;
                SubmitResult::Accepted { is_block: false }
            }
            ShareOutcome::Block { difficulty: observed, hash } => {
                {
                    let mut state = session.state.lock().await;
                    state.record_valid_share(now);
                }
                self.bans.record_valid(peer_ip, now);
                let hash_hex = hex::encode(hash);
                self.record_share(session_id, &address, &worker, job_id, nonce_hex, Some(hash), difficulty, height, now, true)
                    .await;
                info!(address = %address, worker, observed_difficulty = observed, height, hash = %hash_hex, "block candidate found");
                self.file_block(&job, &hash_hex, &address, &worker, height, now).await;
                SubmitResult::Accepted { is_block: true }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_share(
        &self,
        session_id: SessionId,
        address: &Address,
        worker: &str,
        job_id: &str,
        nonce_hex: &str,
        hash: Option<[u8; 32]>,
        difficulty: f64,
        height: u64,
        now: u64,
        is_block: bool,
    ) {
        let share = Share {
            session_id,
            address: address.clone(),
            worker: worker.to_string(),
            job_id: job_id.to_string(),
            nonce: u64::from_str_radix(nonce_hex, 16).unwrap_or(0),
            hash_hex: hash.map(hex::encode).unwrap_or_default(),
            difficulty,
            height,
            timestamp: now,
            is_block,
        };
        if let Err(e) = self.storage.write_share(&share).await {
            warn!(error = %e, "failed to persist accepted share");
        }
        if let Err(e) = self.storage.record_worker_last_seen(address, worker, now).await {
            warn!(error = %e, "failed to record worker last-seen");
        }
    }

    /// Submits the candidate to the active upstream and files it under
    /// Candidates with a round-share snapshot (spec §4.6 WriteBlock, §4.7
    /// block lifecycle). The declared reward is read back from the node
    /// right after submission; if the node hasn't indexed the block yet the
    /// reward is filed as 0 and the block still goes through the normal
    /// orphan/immature lifecycle once the node catches up.
    async fn file_block(&self, job: &Option<Arc<Job>>, hash_hex: &str, address: &Address, worker: &str, height: u64, now: u64) {
        let block_template = job
            .as_ref()
            .and_then(|j| j.opaque_template.as_ref())
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or_default();

        match self.upstream.submit_block(block_template, None).await {
            Ok(true) => {}
            Ok(false) => warn!(hash = %hash_hex, "upstream rejected block submission"),
            Err(e) => warn!(error = %e, hash = %hash_hex, "failed to submit block to upstream"),
        }

        let declared_reward = match self.upstream.current_client().await {
            Ok(client) => match client.get_block_by_hash(hash_hex, false).await {
                Ok(block) => block.declared_reward(),
                Err(e) => {
                    warn!(error = %e, hash = %hash_hex, "could not read back declared reward, filing as 0");
                    0
                }
            },
            Err(e) => {
                warn!(error = %e, hash = %hash_hex, "no healthy upstream to read back declared reward, filing as 0");
                0
            }
        };

        if let Err(e) = self.storage.write_block(height, hash_hex, address, worker, declared_reward, now).await {
            warn!(error = %e, hash = %hash_hex, "failed to file block candidate");
        }
    }

    pub async fn forget_session_dedup(&self, session_id: SessionId) {
        self.validator.lock().await.forget_session(session_id);
    }

    pub async fn maybe_retarget(&self, session: &Arc<SessionHandle>, now: u64) -> Option<f64> {
        let mut state = session.state.lock().await;
        let new_d = vardiff::maybe_retarget(
            &self.config.vardiff,
            state.difficulty,
            state.vardiff_window_start,
            state.shares_since_window_start,
            now,
        )?;
        state.difficulty = new_d;
        state.vardiff_window_start = now;
        state.shares_since_window_start = 0;
        Some(new_d)
    }
}

/// Fixed, protocol-defined offsets: the last 12 bytes of the header prefix
/// hold extranonce2 (4 bytes) followed by the nonce (8 bytes) (spec §9 open
/// question a: opaque constant supplied by the verifier; this pool fixes it
/// at the tail of the header).
fn nonce_offset(job: &Job) -> usize {
    job.header_prefix.len().saturating_sub(8)
}

fn extranonce2_offset(job: &Job) -> usize {
    job.header_prefix.len().saturating_sub(12)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: "j".into(),
            height: 1,
            header_prefix: vec![0u8; 112],
            target: [0u8; 32],
            difficulty: 1,
            clean_jobs: false,
            created_at: 0,
            opaque_template: None,
        }
    }

    #[test]
    fn nonce_offset_is_last_eight_bytes() {
        assert_eq!(nonce_offset(&sample_job()), 104);
    }

    #[test]
    fn extranonce2_offset_is_right_before_nonce() {
        let job = sample_job();
        assert_eq!(extranonce2_offset(&job) + 4, nonce_offset(&job));
    }
}
