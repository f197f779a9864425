//! RPC client for the external wallet signing service (spec §1 "custody/
//! signing of payout transactions (delegated to a wallet service)", §6
//! "Wallet RPC"). The pool never signs anything itself; this crate only
//! talks to the black box.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("wallet returned an error: {code} {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Destination {
    pub address: String,
    pub amount: u64,
    pub asset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletVersion {
    pub version: String,
}

/// A thin object-params JSON-RPC 2.0 client bound to one wallet, with
/// optional HTTP basic auth (spec §6 "Basic-auth supported").
pub struct WalletClient {
    http: reqwest::Client,
    url: String,
    basic_auth: Option<(String, String)>,
}

impl WalletClient {
    pub fn new(url: impl Into<String>, timeout: Duration, basic_auth: Option<(String, String)>) -> Result<Self, WalletError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WalletClient { http, url: url.into(), basic_auth })
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> Result<T, WalletError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let mut builder = self.http.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        let resp: Value = builder.send().await?.json().await?;

        if let Some(err) = resp.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = err.get("message").and_then(Value::as_str).unwrap_or("unknown wallet error").to_string();
            return Err(WalletError::Rpc { code, message });
        }

        let result = resp.get("result").ok_or_else(|| WalletError::Malformed("missing result field".into()))?;
        serde_json::from_value(result.clone()).map_err(|e| WalletError::Malformed(e.to_string()))
    }

    pub async fn get_address(&self) -> Result<String, WalletError> {
        #[derive(Deserialize)]
        struct AddressResult {
            address: String,
        }
        let r: AddressResult = self.call("get_address", json!({})).await?;
        Ok(r.address)
    }

    pub async fn get_balance(&self, asset: Option<&str>) -> Result<u64, WalletError> {
        #[derive(Deserialize)]
        struct BalanceResult {
            balance: u64,
        }
        let r: BalanceResult = self.call("get_balance", json!({ "asset": asset })).await?;
        Ok(r.balance)
    }

    pub async fn is_online(&self) -> bool {
        self.call::<Value>("is_online", json!({})).await.is_ok()
    }

    pub async fn get_version(&self) -> Result<WalletVersion, WalletError> {
        self.call("get_version", json!({})).await
    }

    /// `Transfer(destinations[])`: the wallet may batch multiple
    /// destinations into one transaction and returns a single tx hash for
    /// the whole batch (spec §4.8 "the wallet may batch multiple
    /// destinations into one transaction; the engine records one Payment
    /// per recipient against the same tx hash").
    pub async fn transfer(&self, destinations: &[Destination], broadcast: bool) -> Result<String, WalletError> {
        #[derive(Deserialize)]
        struct TransferResult {
            tx_hash: String,
        }
        let params = json!({
            "tx_type": { "transfers": destinations },
            "broadcast": broadcast,
        });
        let r: TransferResult = self.call("build_transaction", params).await?;
        Ok(r.tx_hash)
    }

    /// Wraps `transfer` with bounded exponential backoff: `1000 * 2^attempt`
    /// milliseconds between attempts, up to `max_attempts` total tries
    /// (spec addendum: a production payout path retries transient RPC
    /// failures before declaring the batch failed).
    pub async fn transfer_with_retry(
        &self,
        destinations: &[Destination],
        broadcast: bool,
        max_attempts: u32,
    ) -> Result<String, WalletError> {
        let mut last_err = None;
        for attempt in 0..max_attempts {
            match self.transfer(destinations, broadcast).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(e) => {
                    let backoff_ms = 1000 * 2u64.pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "wallet transfer attempt failed, retrying in {}ms",
                        backoff_ms
                    );
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }
        Err(last_err.expect("max_attempts > 0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_serializes_without_asset_when_none() {
        let d = Destination { address: "tos1abc".into(), amount: 100, asset: None };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["asset"], Value::Null);
        assert_eq!(v["amount"], 100);
    }
}
