//! Per-session duplicate detection (spec §4.4 step 6, §9 "must be per-session
//! and bounded, not a global set").

use std::collections::VecDeque;
use tos_pool_core::{JobId, SessionId};

/// A single submitted `(job_id, nonce)` tuple, scoped to one session. The
/// session id is carried for callers that key a map of these by session,
/// but equality only needs the job/nonce pair.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    job_id: JobId,
    nonce: Vec<u8>,
}

/// A fixed-capacity ring of recently seen `(job_id, nonce)` tuples for one
/// session. Oldest entries are evicted once capacity is reached, which bounds
/// memory per session regardless of submission rate.
#[derive(Debug)]
pub struct DuplicateTracker {
    capacity: usize,
    seen: VecDeque<Entry>,
}

impl DuplicateTracker {
    pub fn new(capacity: usize) -> Self {
        DuplicateTracker {
            capacity: capacity.max(1),
            seen: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `true` if `(job_id, nonce)` was already observed; otherwise
    /// records it and returns `false`.
    pub fn check_and_record(&mut self, job_id: &JobId, nonce: &[u8]) -> bool {
        if self.seen.iter().any(|e| &e.job_id == job_id && e.nonce == nonce) {
            return true;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(Entry { job_id: job_id.clone(), nonce: nonce.to_vec() });
        false
    }
}

/// A keyed collection of trackers, one per session, for components that own
/// many sessions at once.
#[derive(Debug, Default)]
pub struct SessionDuplicateTrackers {
    capacity: usize,
    trackers: std::collections::HashMap<SessionId, DuplicateTracker>,
}

impl SessionDuplicateTrackers {
    pub fn new(capacity: usize) -> Self {
        SessionDuplicateTrackers { capacity, trackers: std::collections::HashMap::new() }
    }

    pub fn check_and_record(&mut self, session_id: SessionId, job_id: &JobId, nonce: &[u8]) -> bool {
        self.trackers
            .entry(session_id)
            .or_insert_with(|| DuplicateTracker::new(self.capacity))
            .check_and_record(job_id, nonce)
    }

    pub fn remove_session(&mut self, session_id: SessionId) {
        self.trackers.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_submission_is_not_duplicate() {
        let mut t = DuplicateTracker::new(4);
        assert!(!t.check_and_record(&"job-1".to_string(), &[1, 2, 3]));
    }

    #[test]
    fn repeated_submission_is_duplicate() {
        let mut t = DuplicateTracker::new(4);
        t.check_and_record(&"job-1".to_string(), &[1, 2, 3]);
        assert!(t.check_and_record(&"job-1".to_string(), &[1, 2, 3]));
    }

    #[test]
    fn same_nonce_different_job_is_not_duplicate() {
        let mut t = DuplicateTracker::new(4);
        t.check_and_record(&"job-1".to_string(), &[1, 2, 3]);
        assert!(!t.check_and_record(&"job-2".to_string(), &[1, 2, 3]));
    }

    #[test]
    fn capacity_is_bounded_and_evicts_oldest() {
        let mut t = DuplicateTracker::new(2);
        t.check_and_record(&"job-1".to_string(), &[1]);
        t.check_and_record(&"job-1".to_string(), &[2]);
        t.check_and_record(&"job-1".to_string(), &[3]);
        assert_eq!(t.seen.len(), 2);
        assert!(!t.check_and_record(&"job-1".to_string(), &[1]));
    }

    #[test]
    fn sessions_are_isolated() {
        let mut trackers = SessionDuplicateTrackers::new(4);
        trackers.check_and_record(1, &"job-1".to_string(), &[9]);
        assert!(!trackers.check_and_record(2, &"job-1".to_string(), &[9]));
    }
}
