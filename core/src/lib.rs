//! Core data model for the TOS mining pool: sessions, jobs, shares, blocks,
//! miners, payments, and upstream nodes.

pub mod address;
pub mod block;
pub mod job;
pub mod miner;
pub mod payment;
pub mod session;
pub mod share;
pub mod upstream;

pub use address::{Address, AddressError};
pub use block::{Block, BlockStatus, RoundShareSnapshot};
pub use job::{Job, JobId, Target};
pub use miner::{Miner, MinerError};
pub use payment::{Payment, PaymentStatus};
pub use session::{AuthorizedWorker, Session, SessionId};
pub use share::Share;
pub use upstream::UpstreamNode;

use thiserror::Error;

/// Cross-component error type used at the seams between crates that don't
/// need their own specialized variant set (spec §7 taxonomy: transient vs.
/// permanent).
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("miner accounting error: {0}")]
    Miner(#[from] MinerError),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}
