//! Wires header reconstruction, the opaque PoW verifier, difficulty
//! comparison, duplicate detection, and trust sampling into the algorithm
//! described in spec §4.4.

use crate::dedup::SessionDuplicateTrackers;
use crate::header::{self, HeaderError};
use crate::outcome::{InvalidReason, ShareOutcome};
use crate::pow::{observed_difficulty, PowVerifier, SharedVerifier};
use crate::sampling::should_skip_validation;
use tos_pool_core::{Job, JobId, SessionId};

/// Everything the validator needs about the session making the submission.
/// Job resolution (current vs. superseded by a later `cleanJobs` job, or
/// outside the stale grace period) is the Job Dispatcher / Session
/// Manager's concern (spec §4.3); by the time a request reaches here that
/// decision has already been made and is carried in `job_superseded`.
pub struct SubmitRequest<'a> {
    pub session_id: SessionId,
    pub job: Option<&'a Job>,
    pub job_superseded: bool,
    pub session_difficulty: f64,
    pub max_target: &'a [u8; 32],
    pub nonce_hex: &'a str,
    pub nonce_offset: usize,
    pub nonce_width: usize,
    pub extranonce2_hex: Option<&'a str>,
    pub extranonce2_offset: usize,
    pub extranonce2_width: usize,
    pub trust_score: f64,
    pub trust_threshold: f64,
    pub trust_check_percent: u8,
}

pub struct ShareValidator {
    verifier: SharedVerifier,
    dup_trackers: SessionDuplicateTrackers,
}

impl ShareValidator {
    pub fn new(verifier: SharedVerifier, dup_tracker_capacity: usize) -> Self {
        ShareValidator {
            verifier,
            dup_trackers: SessionDuplicateTrackers::new(dup_tracker_capacity),
        }
    }

    pub fn forget_session(&mut self, session_id: SessionId) {
        self.dup_trackers.remove_session(session_id);
    }

    pub fn validate(&mut self, req: SubmitRequest<'_>) -> ShareOutcome {
        let job = match req.job {
            None => return ShareOutcome::Invalid { reason: InvalidReason::JobNotFound, trust_violation: false },
            Some(_) if req.job_superseded => {
                return ShareOutcome::Invalid { reason: InvalidReason::Stale, trust_violation: false }
            }
            Some(job) => job,
        };

        let nonce = match header::parse_nonce(req.nonce_hex, req.nonce_width) {
            Ok(n) => n,
            Err(_) => {
                return ShareOutcome::Invalid { reason: InvalidReason::MalformedSubmission, trust_violation: false }
            }
        };

        let extranonce2 = match req.extranonce2_hex {
            Some(hex_str) => match hex::decode(hex_str) {
                Ok(bytes) if header::check_extranonce2_width(&bytes, req.extranonce2_width).is_ok() => Some(bytes),
                _ => {
                    return ShareOutcome::Invalid { reason: InvalidReason::MalformedSubmission, trust_violation: false }
                }
            },
            None => None,
        };

        // A session eligible to skip full validation that still ends up here
        // (because it was sampled) gets held to a stricter standard: any
        // Invalid from this point on is a trust violation, not an ordinary
        // rejection (spec §4.4, §7).
        let trust_skip_eligible = req.trust_threshold != 0.0 && req.trust_score >= req.trust_threshold;

        // Trust-skip accepts without hashing (spec §4.4), but duplicate
        // detection is cheap enough that we still run it to keep a skipped
        // session from farming one accepted nonce repeatedly.
        if should_skip_validation(req.trust_score, req.trust_threshold, req.trust_check_percent) {
            let is_dup = self
                .dup_trackers
                .check_and_record(req.session_id, &job.id, &nonce);
            if is_dup {
                return ShareOutcome::Invalid { reason: InvalidReason::Duplicate, trust_violation: false };
            }
            return ShareOutcome::Valid { difficulty: req.session_difficulty as u64, hash: None };
        }

        let header_bytes = match header::reconstruct_header(
            &job.header_prefix,
            &nonce,
            req.nonce_offset,
            extranonce2.as_deref().map(|e| (e, req.extranonce2_offset)),
        ) {
            Ok(h) => h,
            Err(HeaderError::NonceOutOfBounds { .. }) | Err(HeaderError::ExtranonceLengthMismatch { .. }) => {
                return ShareOutcome::Invalid {
                    reason: InvalidReason::MalformedSubmission,
                    trust_violation: trust_skip_eligible,
                }
            }
            Err(HeaderError::MalformedNonce(_)) => {
                return ShareOutcome::Invalid {
                    reason: InvalidReason::MalformedSubmission,
                    trust_violation: trust_skip_eligible,
                }
            }
        };

        let hash = self.verifier.hash(&header_bytes);
        let difficulty = observed_difficulty(req.max_target, &hash);

        if (difficulty as f64) < req.session_difficulty {
            return ShareOutcome::Invalid { reason: InvalidReason::LowDifficulty, trust_violation: trust_skip_eligible };
        }

        let is_dup = self.dup_trackers.check_and_record(req.session_id, &job.id, &nonce);
        if is_dup {
            return ShareOutcome::Invalid { reason: InvalidReason::Duplicate, trust_violation: trust_skip_eligible };
        }

        if difficulty >= job.difficulty {
            ShareOutcome::Block { difficulty, hash }
        } else {
            ShareOutcome::Valid { difficulty, hash: Some(hash) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::test_support::DoubleSha256;
    use std::sync::Arc;

    fn job(difficulty: u64) -> Job {
        Job {
            id: "job-1".into(),
            height: 100,
            header_prefix: vec![0u8; 16],
            target: [0xffu8; 32],
            difficulty,
            clean_jobs: false,
            created_at: 1000,
            opaque_template: None,
        }
    }

    fn base_req<'a>(job: &'a Job, max_target: &'a [u8; 32]) -> SubmitRequest<'a> {
        SubmitRequest {
            session_id: 1,
            job: Some(job),
            job_superseded: false,
            session_difficulty: 1.0,
            max_target,
            nonce_hex: "00000001",
            nonce_offset: 8,
            nonce_width: 4,
            extranonce2_hex: None,
            extranonce2_offset: 0,
            extranonce2_width: 0,
            trust_score: 0.0,
            trust_threshold: 0.0,
            trust_check_percent: 100,
        }
    }

    #[test]
    fn missing_job_is_invalid_job_not_found() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let max_target = [0xffu8; 32];
        let req = SubmitRequest {
            session_id: 1,
            job: None,
            job_superseded: false,
            session_difficulty: 1.0,
            max_target: &max_target,
            nonce_hex: "00000001",
            nonce_offset: 8,
            nonce_width: 4,
            extranonce2_hex: None,
            extranonce2_offset: 0,
            extranonce2_width: 0,
            trust_score: 0.0,
            trust_threshold: 0.0,
            trust_check_percent: 100,
        };
        assert_eq!(
            v.validate(req),
            ShareOutcome::Invalid { reason: InvalidReason::JobNotFound, trust_violation: false }
        );
    }

    #[test]
    fn superseded_job_is_invalid_stale() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1_000_000);
        let max_target = [0xffu8; 32];
        let mut req = base_req(&j, &max_target);
        req.job_superseded = true;
        assert_eq!(v.validate(req), ShareOutcome::Invalid { reason: InvalidReason::Stale, trust_violation: false });
    }

    #[test]
    fn malformed_nonce_hex_is_invalid() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1);
        let max_target = [0xffu8; 32];
        let mut req = base_req(&j, &max_target);
        req.nonce_hex = "zz";
        assert_eq!(
            v.validate(req),
            ShareOutcome::Invalid { reason: InvalidReason::MalformedSubmission, trust_violation: false }
        );
    }

    #[test]
    fn duplicate_submission_rejected_on_second_attempt() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1); // difficulty 1 so almost anything qualifies as a block/valid
        let max_target = [0xffu8; 32];
        let req1 = base_req(&j, &max_target);
        let req2 = base_req(&j, &max_target);
        let first = v.validate(req1);
        assert!(!matches!(first, ShareOutcome::Invalid { reason: InvalidReason::Duplicate, .. }));
        let second = v.validate(req2);
        assert!(matches!(second, ShareOutcome::Invalid { reason: InvalidReason::Duplicate, .. }));
    }

    #[test]
    fn trust_skip_accepts_without_hashing() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1_000_000_000);
        let max_target = [0xffu8; 32];
        let mut req = base_req(&j, &max_target);
        req.session_difficulty = 42.0;
        req.trust_score = 1_000.0;
        req.trust_threshold = 1.0;
        req.trust_check_percent = 0;
        assert_eq!(v.validate(req), ShareOutcome::Valid { difficulty: 42, hash: None });
    }

    #[test]
    fn sampled_failure_on_trust_eligible_session_is_a_trust_violation() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1_000_000_000); // unreachable difficulty: the share always comes back low
        let max_target = [0xffu8; 32];
        let mut req = base_req(&j, &max_target);
        req.trust_score = 1_000.0;
        req.trust_threshold = 1.0;
        req.trust_check_percent = 100; // always sampled despite being trust-eligible
        assert_eq!(
            v.validate(req),
            ShareOutcome::Invalid { reason: InvalidReason::LowDifficulty, trust_violation: true }
        );
    }

    #[test]
    fn sampled_failure_below_trust_threshold_is_not_a_trust_violation() {
        let mut v = ShareValidator::new(Arc::new(DoubleSha256), 16);
        let j = job(1_000_000_000);
        let max_target = [0xffu8; 32];
        let mut req = base_req(&j, &max_target);
        req.trust_score = 0.0;
        req.trust_threshold = 1.0;
        req.trust_check_percent = 100;
        assert_eq!(
            v.validate(req),
            ShareOutcome::Invalid { reason: InvalidReason::LowDifficulty, trust_violation: false }
        );
    }
}
