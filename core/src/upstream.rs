//! Upstream (U): one configured TOS node the pool can talk to.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub name: String,
    pub url: String,

    /// Relative weight used to break ties between otherwise-equal healthy
    /// nodes (spec §4.1 selection: weight, then height, then name).
    pub weight: u32,

    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_seen_height: u64,
    pub last_response_ms: u64,
}

impl UpstreamNode {
    pub fn new(name: String, url: String, weight: u32, timeout: Duration) -> Self {
        UpstreamNode {
            name,
            url,
            weight,
            timeout,
            healthy: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_seen_height: 0,
            last_response_ms: 0,
        }
    }

    /// Records a successful probe or call (spec §4.1: N consecutive
    /// successes bring an unhealthy node back before it's eligible again).
    pub fn record_success(&mut self, height: u64, response_ms: u64, healthy_after: u32) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.last_seen_height = height;
        self.last_response_ms = response_ms;
        if self.consecutive_successes >= healthy_after {
            self.healthy = true;
        }
    }

    /// Records a failed probe or call (spec §4.1: N consecutive failures
    /// mark a node unhealthy and remove it from selection).
    pub fn record_failure(&mut self, unhealthy_after: u32) {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= unhealthy_after {
            self.healthy = false;
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> UpstreamNode {
        UpstreamNode::new("primary".into(), "http://127.0.0.1:8080".into(), 10, Duration::from_secs(5))
    }

    #[test]
    fn becomes_healthy_only_after_threshold_successes() {
        let mut n = node();
        n.record_success(100, 20, 3);
        assert!(!n.healthy);
        n.record_success(100, 20, 3);
        n.record_success(100, 20, 3);
        assert!(n.healthy);
    }

    #[test]
    fn becomes_unhealthy_after_threshold_failures() {
        let mut n = node();
        n.healthy = true;
        n.record_failure(2);
        assert!(n.healthy);
        n.record_failure(2);
        assert!(!n.healthy);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut n = node();
        n.record_failure(5);
        n.record_failure(5);
        n.record_success(100, 10, 3);
        assert_eq!(n.consecutive_failures, 0);
    }
}
