//! Trust-based validation sampling (spec §4.4 "Trust-based sampling").

/// Whether a submission from a session at `trust_score` should skip full
/// hashing this time. `trust_threshold == 0` always validates (spec: "the
/// trust-threshold must be 0-disabled"). `trust_check_percent == 100`
/// likewise always validates, since the skip fraction is `100 - percent`.
pub fn should_skip_validation(trust_score: f64, trust_threshold: f64, trust_check_percent: u8) -> bool {
    if trust_threshold == 0.0 {
        return false;
    }
    if trust_score < trust_threshold {
        return false;
    }
    let skip_percent = 100u32.saturating_sub(trust_check_percent as u32);
    if skip_percent == 0 {
        return false;
    }
    (tos_pool_util::sample_percent() as u32) < skip_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_threshold_zero_never_skips() {
        for _ in 0..50 {
            assert!(!should_skip_validation(1_000_000.0, 0.0, 0));
        }
    }

    #[test]
    fn trust_check_percent_100_never_skips() {
        for _ in 0..50 {
            assert!(!should_skip_validation(1_000.0, 10.0, 100));
        }
    }

    #[test]
    fn below_threshold_never_skips() {
        for _ in 0..50 {
            assert!(!should_skip_validation(1.0, 10.0, 0));
        }
    }
}
