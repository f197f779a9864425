//! PPLNS Accounter (C7): reward splitting over a block's round-share
//! snapshot (spec §4.7).
//!
//! The design note in spec §9(c) on a dynamic, difficulty-scaled window is
//! left unrealized here; this implements the static round-based scheme the
//! spec calls the default ("treat as a static round-based scheme unless the
//! implementer chooses to implement [the dynamic window]").

use tos_pool_core::{Address, RoundShareSnapshot};

/// `reward_a = floor((1 - pool_fee%) * block_reward * s_a / S)` for every
/// address in the snapshot. The pool fee plus any rounding drift goes to
/// `fee_address` as a real entry in the same ledger, which is what keeps
/// `Σ splits == block_reward` exactly (spec's supplemented "pool account
/// crediting" — see the workspace's expanded requirements doc).
pub fn compute_reward_splits(
    round_shares: &RoundShareSnapshot,
    round_shares_total: f64,
    block_reward: u64,
    pool_fee_percent: f64,
    fee_address: &Address,
) -> Vec<(Address, u64)> {
    if round_shares_total <= 0.0 || round_shares.is_empty() {
        return vec![(fee_address.clone(), block_reward)];
    }

    let net_reward = (1.0 - pool_fee_percent / 100.0) * block_reward as f64;
    let mut splits = Vec::with_capacity(round_shares.len() + 1);
    let mut distributed: u64 = 0;

    for (address, share) in round_shares {
        let reward = (net_reward * share / round_shares_total).floor().max(0.0) as u64;
        distributed += reward;
        splits.push((address.clone(), reward));
    }

    let remainder = block_reward.saturating_sub(distributed);
    splits.push((fee_address.clone(), remainder));
    splits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn splits_match_worked_example() {
        // spec §8 E3: network difficulty 1_000_000, block_reward
        // 10_000_000_000, pool_fee 1%, shares {A:600_000, B:400_000}.
        let mut shares = RoundShareSnapshot::new();
        shares.insert(addr("aaaaaaaaaaaaaaaa"), 600_000.0);
        shares.insert(addr("bbbbbbbbbbbbbbbb"), 400_000.0);
        let fee_address = addr("feeaddrfeeaddr01");

        let splits = compute_reward_splits(&shares, 1_000_000.0, 10_000_000_000, 1.0, &fee_address);

        let a = splits.iter().find(|(a, _)| a == &addr("aaaaaaaaaaaaaaaa")).unwrap().1;
        let b = splits.iter().find(|(a, _)| a == &addr("bbbbbbbbbbbbbbbb")).unwrap().1;
        let fee = splits.iter().find(|(a, _)| a == &fee_address).unwrap().1;

        assert_eq!(a, 5_940_000_000);
        assert_eq!(b, 3_960_000_000);
        assert_eq!(fee, 100_000_000);
    }

    #[test]
    fn splits_sum_to_exactly_block_reward() {
        let mut shares = RoundShareSnapshot::new();
        shares.insert(addr("aaaaaaaaaaaaaaaa"), 333_333.0);
        shares.insert(addr("bbbbbbbbbbbbbbbb"), 333_333.0);
        shares.insert(addr("cccccccccccccccc"), 333_334.0);
        let fee_address = addr("feeaddrfeeaddr01");

        let splits = compute_reward_splits(&shares, 1_000_000.0, 7_777_777, 2.5, &fee_address);
        let total: u64 = splits.iter().map(|(_, amount)| amount).sum();
        assert_eq!(total, 7_777_777);
    }

    #[test]
    fn empty_round_sends_everything_to_fee_address() {
        let shares = RoundShareSnapshot::new();
        let fee_address = addr("feeaddrfeeaddr01");
        let splits = compute_reward_splits(&shares, 0.0, 5_000, 1.0, &fee_address);
        assert_eq!(splits, vec![(fee_address, 5_000)]);
    }
}
