//! Ban policy (spec §4.5 "Security discipline" / "Ban policy"). Independent
//! from the Share Validator: tracks per-IP invalid-share ratios, malformed
//! JSON counts, and connection counts, and decides when an IP is banned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct BanPolicyConfig {
    pub ban_threshold_percent: f64,
    pub ban_duration_secs: u64,
    pub malformed_json_limit: u32,
    pub max_connections_per_ip: u32,
    /// Minimum number of shares observed before the invalid ratio is
    /// trusted; avoids banning a peer on one early invalid share.
    pub min_shares_for_ratio: u64,
}

#[derive(Default)]
struct IpState {
    valid_shares: u64,
    invalid_shares: u64,
    malformed_json: u32,
    connections: u32,
    banned_until: Option<u64>,
}

/// All mutable state behind one mutex; ban decisions happen at low
/// frequency relative to the share-validation hot path so contention here
/// is not a concern.
pub struct BanRegistry {
    config: BanPolicyConfig,
    ips: Mutex<HashMap<IpAddr, IpState>>,
}

impl BanRegistry {
    pub fn new(config: BanPolicyConfig) -> Self {
        BanRegistry { config, ips: Mutex::new(HashMap::new()) }
    }

    pub fn is_banned(&self, ip: IpAddr, now: u64) -> bool {
        let ips = self.ips.lock().unwrap();
        matches!(ips.get(&ip).and_then(|s| s.banned_until), Some(until) if until > now)
    }

    pub fn register_connection(&self, ip: IpAddr) -> bool {
        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_default();
        if state.connections >= self.config.max_connections_per_ip {
            return false;
        }
        state.connections += 1;
        true
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let mut ips = self.ips.lock().unwrap();
        if let Some(state) = ips.get_mut(&ip) {
            state.connections = state.connections.saturating_sub(1);
        }
    }

    /// Records a valid share and returns whether the IP is (now) banned.
    pub fn record_valid(&self, ip: IpAddr, now: u64) -> bool {
        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_default();
        state.valid_shares += 1;
        Self::is_banned_locked(state, now)
    }

    /// Records an invalid share and bans the IP if the ratio crosses
    /// `ban_threshold_percent` once enough samples exist.
    pub fn record_invalid(&self, ip: IpAddr, now: u64) -> bool {
        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_default();
        state.invalid_shares += 1;

        let total = state.valid_shares + state.invalid_shares;
        if total >= self.config.min_shares_for_ratio {
            let ratio = state.invalid_shares as f64 / total as f64 * 100.0;
            if ratio > self.config.ban_threshold_percent {
                state.banned_until = Some(now + self.config.ban_duration_secs);
            }
        }
        Self::is_banned_locked(state, now)
    }

    /// Records a malformed-JSON event; bans immediately once the configured
    /// limit is exceeded (spec §7 "Malformed request ... ban on repeated
    /// offense").
    pub fn record_malformed_json(&self, ip: IpAddr, now: u64) -> bool {
        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_default();
        state.malformed_json += 1;
        if state.malformed_json > self.config.malformed_json_limit {
            state.banned_until = Some(now + self.config.ban_duration_secs);
        }
        Self::is_banned_locked(state, now)
    }

    /// Immediate ban for a line that exceeded the read-buffer cap (spec
    /// §4.5 "Flood" discipline) — no threshold, one offense is enough.
    pub fn ban_for_flood(&self, ip: IpAddr, now: u64) {
        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_default();
        state.banned_until = Some(now + self.config.ban_duration_secs);
    }

    fn is_banned_locked(state: &IpState, now: u64) -> bool {
        matches!(state.banned_until, Some(until) if until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn cfg() -> BanPolicyConfig {
        BanPolicyConfig {
            ban_threshold_percent: 50.0,
            ban_duration_secs: 600,
            malformed_json_limit: 5,
            max_connections_per_ip: 10,
            min_shares_for_ratio: 4,
        }
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn not_banned_below_ratio_threshold() {
        let reg = BanRegistry::new(cfg());
        reg.record_valid(ip(), 0);
        reg.record_valid(ip(), 0);
        reg.record_valid(ip(), 0);
        assert!(!reg.record_invalid(ip(), 0));
    }

    #[test]
    fn banned_once_ratio_exceeds_threshold_with_enough_samples() {
        let reg = BanRegistry::new(cfg());
        reg.record_invalid(ip(), 0);
        reg.record_invalid(ip(), 0);
        reg.record_invalid(ip(), 0);
        assert!(reg.record_invalid(ip(), 0));
        assert!(reg.is_banned(ip(), 100));
        assert!(!reg.is_banned(ip(), 10_000));
    }

    #[test]
    fn malformed_json_bans_past_limit() {
        let reg = BanRegistry::new(cfg());
        for _ in 0..5 {
            assert!(!reg.record_malformed_json(ip(), 0));
        }
        assert!(reg.record_malformed_json(ip(), 0));
    }

    #[test]
    fn connection_cap_is_enforced_and_released() {
        let reg = BanRegistry::new(BanPolicyConfig { max_connections_per_ip: 1, ..cfg() });
        assert!(reg.register_connection(ip()));
        assert!(!reg.register_connection(ip()));
        reg.release_connection(ip());
        assert!(reg.register_connection(ip()));
    }

    #[test]
    fn flood_bans_immediately_with_no_threshold() {
        let reg = BanRegistry::new(cfg());
        reg.ban_for_flood(ip(), 0);
        assert!(reg.is_banned(ip(), 1));
    }
}
