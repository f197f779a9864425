//! Payout Engine (C8): threshold batching, locking, and wallet
//! reconciliation for miner balances (spec §4.8).

pub mod engine;

pub use engine::{PayoutConfig, PayoutEngine, PayoutEngineStatus, PayoutError, PayoutRunSummary, ReconcileSummary};
