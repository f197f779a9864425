//! Per-session variable-difficulty controller (spec §4.5 "Vardiff").

#[derive(Debug, Clone)]
pub struct VardiffConfig {
    pub target_time_secs: f64,
    pub retarget_secs: u64,
    pub variance: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

/// Evaluates one retarget for a session whose window started at
/// `window_start` with `shares_since_window_start` accepted shares, given
/// the current time. Returns the new difficulty if a retarget is due and it
/// differs from `current_difficulty`, else `None`.
pub fn maybe_retarget(
    config: &VardiffConfig,
    current_difficulty: f64,
    window_start: u64,
    shares_since_window_start: u64,
    now: u64,
) -> Option<f64> {
    let elapsed = now.saturating_sub(window_start);
    if elapsed < config.retarget_secs {
        return None;
    }
    if shares_since_window_start == 0 {
        // No shares at all in the window: treat as maximally slow, drop
        // toward the floor rather than divide by zero.
        let new_d = (current_difficulty * (1.0 - config.variance)).clamp(config.min_difficulty, config.max_difficulty);
        return if new_d != current_difficulty { Some(new_d) } else { None };
    }

    let observed_rate = shares_since_window_start as f64 / elapsed as f64;
    let target_rate = 1.0 / config.target_time_secs;
    let ratio = (observed_rate / target_rate).clamp(1.0 - config.variance, 1.0 + config.variance);

    let new_d = (current_difficulty * ratio).clamp(config.min_difficulty, config.max_difficulty);
    if new_d != current_difficulty {
        Some(new_d)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VardiffConfig {
        VardiffConfig {
            target_time_secs: 10.0,
            retarget_secs: 60,
            variance: 0.3,
            min_difficulty: 0.01,
            max_difficulty: 1_000_000.0,
        }
    }

    #[test]
    fn no_retarget_before_window_elapses() {
        assert_eq!(maybe_retarget(&cfg(), 1.0, 100, 5, 120), None);
    }

    #[test]
    fn faster_than_target_increases_difficulty_within_clamp() {
        // 12 shares in 60s against a 10s target = 2x rate, clamped to 1.3x.
        let new_d = maybe_retarget(&cfg(), 1.0, 0, 12, 60).unwrap();
        assert!((new_d - 1.3).abs() < 1e-9);
    }

    #[test]
    fn slower_than_target_decreases_difficulty_within_clamp() {
        // 2 shares in 60s against a 10s target = 0.33x rate, clamped to 0.7x.
        let new_d = maybe_retarget(&cfg(), 1.0, 0, 2, 60).unwrap();
        assert!((new_d - 0.7).abs() < 1e-9);
    }

    #[test]
    fn result_is_always_within_min_max_bounds() {
        let cfg = cfg();
        let new_d = maybe_retarget(&cfg, 999_999.0, 0, 1000, 60).unwrap();
        assert!(new_d <= cfg.max_difficulty && new_d >= cfg.min_difficulty);
    }

    #[test]
    fn zero_shares_in_window_drops_toward_floor() {
        let new_d = maybe_retarget(&cfg(), 1.0, 0, 0, 60).unwrap();
        assert!((new_d - 0.7).abs() < 1e-9);
    }
}
