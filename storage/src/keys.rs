//! Redis key namespace for the pool. Every key lives under the `pool:`
//! prefix (spec §4.2).

pub fn miner(address: &str) -> String {
    format!("pool:miner:{address}")
}

pub fn worker_last_seen(address: &str, worker: &str) -> String {
    format!("pool:worker:{address}:{worker}:last_seen")
}

pub fn round_shares() -> &'static str {
    "pool:round:shares"
}

pub fn round_shares_total() -> &'static str {
    "pool:round:shares_total"
}

pub fn hashrate_set(address: &str) -> String {
    format!("pool:hashrate:{address}")
}

pub fn block(hash: &str) -> String {
    format!("pool:block:{hash}")
}

pub fn candidates() -> &'static str {
    "pool:blocks:candidates"
}

pub fn immature() -> &'static str {
    "pool:blocks:immature"
}

pub fn matured() -> &'static str {
    "pool:blocks:matured"
}

pub fn orphans() -> &'static str {
    "pool:blocks:orphans"
}

pub fn blocks_found_total() -> &'static str {
    "pool:stats:blocks_found"
}

pub fn payment(id: &str) -> String {
    format!("pool:payment:{id}")
}

pub fn pending_payments() -> &'static str {
    "pool:payments:pending"
}

/// Durable append-only record of confirmed payouts, kept separate from the
/// pending set (spec §4.2 "Pending payments are a durable list separate
/// from confirmed history").
pub fn payment_history() -> &'static str {
    "pool:payments:history"
}

pub fn payout_lock() -> &'static str {
    "pool:payout:lock"
}

pub fn blacklist() -> &'static str {
    "pool:policy:blacklist"
}

pub fn whitelist() -> &'static str {
    "pool:policy:whitelist"
}
