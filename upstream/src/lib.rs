//! Health-checked multi-node failover and JSON-RPC adapter to the upstream
//! TOS node (spec §4.1, §6).

pub mod coordinator;
pub mod rpc;

pub use coordinator::{CoordinatorConfig, CoordinatorError, UpstreamCoordinator, UpstreamStatus};
pub use rpc::{BlockTemplate, NodeInfo, RpcClient, RpcError, UpstreamBlock};
