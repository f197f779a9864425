//! Block lifecycle unlocking (C6) and PPLNS reward accounting (C7) for the
//! TOS mining pool (spec §4.6, §4.7).

pub mod pplns;
pub mod unlocker;

pub use pplns::compute_reward_splits;
pub use unlocker::{BlockUnlocker, UnlockerConfig, UnlockerError, UnlockerSummary};
