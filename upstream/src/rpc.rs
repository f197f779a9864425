//! JSON-RPC adapter to a single upstream TOS node (spec §6: object-params
//! JSON-RPC). Converts wire shapes (millisecond timestamps, decimal-string
//! difficulty) into canonical in-memory types at this boundary, per spec §9
//! ("an adapter layer inside the pool converts to canonical in-memory
//! types").

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node returned an error: {code} {message}")]
    Node { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub template: String,
    pub algorithm: String,
    pub height: u64,
    pub topoheight: u64,

    /// Decimal string on the wire; kept as a string here and parsed by the
    /// caller, since the exact numeric type (u64 vs u128) depends on the
    /// algorithm's opaque difficulty scale (spec §9 open question a).
    pub difficulty: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamBlock {
    pub hash: String,
    pub height: u64,
    pub topoheight: u64,
    pub tips: Vec<String>,

    /// Milliseconds on the wire.
    pub timestamp: u64,

    pub miner_reward: u64,
    pub total_fees: u64,
    pub difficulty: String,
}

impl UpstreamBlock {
    /// Normalizes the upstream's millisecond timestamp to seconds at this
    /// boundary (spec §9).
    pub fn timestamp_secs(&self) -> u64 {
        tos_pool_util::millis_to_secs(self.timestamp)
    }

    pub fn declared_reward(&self) -> u64 {
        self.miner_reward + self.total_fees
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub height: u64,
    pub topoheight: u64,
    pub network: String,
}

/// A thin object-params JSON-RPC 2.0 client bound to one node URL. No
/// retry/failover logic lives here — that's the coordinator's job.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(RpcClient { http, url: url.into() })
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp: Value = self.http.post(&self.url).json(&body).send().await?.json().await?;

        if let Some(err) = resp.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown upstream error")
                .to_string();
            return Err(RpcError::Node { code, message });
        }

        let result = resp
            .get("result")
            .ok_or_else(|| RpcError::Malformed("missing result field".into()))?;
        serde_json::from_value(result.clone()).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    pub async fn get_block_template(&self, address: &str) -> Result<BlockTemplate, RpcError> {
        self.call("get_block_template", json!({ "address": address })).await
    }

    pub async fn submit_block(&self, block_template: &str, miner_work: Option<&str>) -> Result<bool, RpcError> {
        let mut params = serde_json::Map::new();
        params.insert("block_template".into(), json!(block_template));
        if let Some(work) = miner_work {
            params.insert("miner_work".into(), json!(work));
        }
        self.call("submit_block", Value::Object(params)).await
    }

    pub async fn get_block_at_topoheight(&self, topoheight: u64, include_txs: bool) -> Result<UpstreamBlock, RpcError> {
        self.call(
            "get_block_at_topoheight",
            json!({ "topoheight": topoheight, "include_txs": include_txs }),
        )
        .await
    }

    pub async fn get_block_by_hash(&self, hash: &str, include_txs: bool) -> Result<UpstreamBlock, RpcError> {
        self.call("get_block_by_hash", json!({ "hash": hash, "include_txs": include_txs })).await
    }

    pub async fn get_top_block(&self, include_txs: bool) -> Result<UpstreamBlock, RpcError> {
        self.call("get_top_block", json!({ "include_txs": include_txs })).await
    }

    pub async fn get_info(&self) -> Result<NodeInfo, RpcError> {
        self.call("get_info", json!({})).await
    }

    pub async fn p2p_status(&self) -> Result<Value, RpcError> {
        self.call("p2p_status", json!({})).await
    }

    /// `asset` is 64 zero-hex characters for the native asset (spec §6).
    pub fn native_asset() -> String {
        "0".repeat(64)
    }

    pub async fn get_balance(&self, address: &str, asset: &str) -> Result<u64, RpcError> {
        #[derive(Deserialize)]
        struct BalanceResult {
            balance: u64,
        }
        let r: BalanceResult = self
            .call("get_balance", json!({ "address": address, "asset": asset }))
            .await?;
        Ok(r.balance)
    }

    pub async fn get_nonce(&self, address: &str) -> Result<u64, RpcError> {
        #[derive(Deserialize)]
        struct NonceResult {
            nonce: u64,
        }
        let r: NonceResult = self.call("get_nonce", json!({ "address": address })).await?;
        Ok(r.nonce)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}
