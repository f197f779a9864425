//! Upstream Coordinator (C1): health-checked multi-node failover.

use crate::rpc::{RpcClient, RpcError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tos_pool_core::UpstreamNode;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("all upstreams are unhealthy")]
    AllUnhealthy,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct CoordinatorConfig {
    pub health_check_interval: Duration,
    pub max_failures: u32,
    pub recovery_threshold: u32,
}

struct Node {
    state: RwLock<UpstreamNode>,
    client: RpcClient,
}

pub struct UpstreamCoordinator {
    nodes: Vec<Node>,
    config: CoordinatorConfig,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub url: String,
    pub healthy: bool,
    pub weight: u32,
    pub last_seen_height: u64,
}

impl UpstreamCoordinator {
    pub fn new(nodes: Vec<UpstreamNode>, config: CoordinatorConfig) -> Result<Self, RpcError> {
        let mut built = Vec::with_capacity(nodes.len());
        for n in nodes {
            let client = RpcClient::new(n.url.clone(), n.timeout)?;
            built.push(Node {
                state: RwLock::new(n),
                client,
            });
        }
        Ok(UpstreamCoordinator { nodes: built, config })
    }

    /// Probes every configured node in parallel (spec §4.1). Call this on
    /// `health_check_interval`.
    pub async fn run_health_checks(&self) {
        let checks = self.nodes.iter().map(|n| self.probe_one(n));
        futures::future::join_all(checks).await;
    }

    async fn probe_one(&self, node: &Node) {
        let started = std::time::Instant::now();
        let was_healthy = node.state.read().await.healthy;

        match node.client.get_top_block(false).await {
            Ok(block) => {
                let response_ms = started.elapsed().as_millis() as u64;
                let mut st = node.state.write().await;
                st.record_success(block.height, response_ms, self.config.recovery_threshold);
                if !was_healthy && st.healthy {
                    info!(name = %st.name, "upstream recovered, now healthy");
                }
            }
            Err(e) => {
                let mut st = node.state.write().await;
                st.record_failure(self.config.max_failures);
                if was_healthy && !st.healthy {
                    warn!(name = %st.name, error = %e, "upstream marked unhealthy");
                }
            }
        }
    }

    /// The healthy node with maximum weight; ties broken by highest
    /// observed height, then by name (spec §4.1).
    async fn select_active(&self) -> Option<&Node> {
        let mut best: Option<(&Node, u32, u64, &str)> = None;
        for n in &self.nodes {
            let st = n.state.read().await;
            if !st.healthy {
                continue;
            }
            let candidate = (n, st.weight, st.last_seen_height, st.name.as_str());
            best = match best {
                None => Some(candidate),
                Some(cur) => {
                    if (candidate.1, candidate.2, std::cmp::Reverse(candidate.3))
                        > (cur.1, cur.2, std::cmp::Reverse(cur.3))
                    {
                        Some(candidate)
                    } else {
                        Some(cur)
                    }
                }
            };
        }
        best.map(|(n, ..)| n)
    }

    /// Returns a client routed to the currently active upstream.
    pub async fn current_client(&self) -> Result<&RpcClient, CoordinatorError> {
        self.select_active().await.map(|n| &n.client).ok_or(CoordinatorError::AllUnhealthy)
    }

    /// Retries across healthy upstreams on transient error (spec §4.1).
    pub async fn submit_block(&self, block_template: &str, miner_work: Option<&str>) -> Result<bool, CoordinatorError> {
        let mut last_err = None;
        for n in &self.nodes {
            if !n.state.read().await.healthy {
                continue;
            }
            match n.client.submit_block(block_template, miner_work).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) => {
                    warn!(name = %n.state.read().await.name, error = %e, "submit_block failed, trying next upstream");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(CoordinatorError::Rpc(e)),
            None => Err(CoordinatorError::AllUnhealthy),
        }
    }

    pub async fn status(&self) -> Vec<UpstreamStatus> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for n in &self.nodes {
            let st = n.state.read().await;
            out.push(UpstreamStatus {
                name: st.name.clone(),
                url: st.url.clone(),
                healthy: st.healthy,
                weight: st.weight,
                last_seen_height: st.last_seen_height,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(name: &str, weight: u32) -> UpstreamNode {
        UpstreamNode::new(name.into(), "http://127.0.0.1:9999".into(), weight, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn selects_highest_weight_healthy_node() {
        let cfg = CoordinatorConfig {
            health_check_interval: Duration::from_secs(10),
            max_failures: 3,
            recovery_threshold: 1,
        };
        let coord = UpstreamCoordinator::new(vec![node("primary", 10), node("standby", 5)], cfg).unwrap();
        coord.nodes[0].state.write().await.healthy = true;
        coord.nodes[1].state.write().await.healthy = true;

        let active = coord.select_active().await.unwrap();
        assert_eq!(active.state.read().await.name, "primary");
    }

    #[tokio::test]
    async fn falls_back_to_only_healthy_node() {
        let cfg = CoordinatorConfig {
            health_check_interval: Duration::from_secs(10),
            max_failures: 3,
            recovery_threshold: 1,
        };
        let coord = UpstreamCoordinator::new(vec![node("primary", 10), node("standby", 5)], cfg).unwrap();
        coord.nodes[1].state.write().await.healthy = true;

        let active = coord.select_active().await.unwrap();
        assert_eq!(active.state.read().await.name, "standby");
    }

    #[tokio::test]
    async fn no_healthy_nodes_is_none() {
        let cfg = CoordinatorConfig {
            health_check_interval: Duration::from_secs(10),
            max_failures: 3,
            recovery_threshold: 1,
        };
        let coord = UpstreamCoordinator::new(vec![node("primary", 10)], cfg).unwrap();
        assert!(coord.select_active().await.is_none());
    }
}
