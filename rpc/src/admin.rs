//! Admin REST handlers (spec §6): everything an operator needs that isn't
//! part of the mining wire protocol itself.

use crate::{err_status, AdminContext};
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tos_pool_core::Address;
use tos_pool_storage::Storage;
use tracing::warn;

fn parse_address(raw: &str) -> Result<Address, axum::response::Response> {
    Address::parse(raw).map_err(|e| err_status(StatusCode::BAD_REQUEST, e.to_string()).into_response())
}

pub async fn upstream_status(Extension(ctx): Extension<AdminContext>) -> impl IntoResponse {
    let nodes = ctx.upstream.status().await;
    Json(json!({ "upstreams": nodes })).into_response()
}

pub async fn pending_payouts(Extension(ctx): Extension<AdminContext>) -> impl IntoResponse {
    let pending = match ctx.storage.list_pending_payments().await {
        Ok(p) => p,
        Err(e) => return err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let engine_status = ctx.payout.status();
    Json(json!({ "pending": pending, "last_run": engine_status })).into_response()
}

pub async fn is_blacklisted(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.is_blacklisted(&address).await {
        Ok(blacklisted) => Json(json!({ "address": address.as_str(), "blacklisted": blacklisted })).into_response(),
        Err(e) => err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn blacklist(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.blacklist(&address).await {
        Ok(()) => Json(json!({ "address": address.as_str(), "blacklisted": true })).into_response(),
        Err(e) => {
            warn!(error = %e, address = %address, "failed to blacklist address");
            err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn unblacklist(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.unblacklist(&address).await {
        Ok(()) => Json(json!({ "address": address.as_str(), "blacklisted": false })).into_response(),
        Err(e) => {
            warn!(error = %e, address = %address, "failed to unblacklist address");
            err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn is_whitelisted(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.is_whitelisted(&address).await {
        Ok(whitelisted) => Json(json!({ "address": address.as_str(), "whitelisted": whitelisted })).into_response(),
        Err(e) => err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn whitelist(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.whitelist(&address).await {
        Ok(()) => Json(json!({ "address": address.as_str(), "whitelisted": true })).into_response(),
        Err(e) => {
            warn!(error = %e, address = %address, "failed to whitelist address");
            err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn unwhitelist(
    Extension(ctx): Extension<AdminContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp.into_response(),
    };
    match ctx.storage.unwhitelist(&address).await {
        Ok(()) => Json(json!({ "address": address.as_str(), "whitelisted": false })).into_response(),
        Err(e) => {
            warn!(error = %e, address = %address, "failed to unwhitelist address");
            err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Snapshot of candidate/immature blocks and pending payments, for manual
/// disaster-recovery backups (spec §6 "backup"). Matured/orphaned blocks and
/// confirmed/failed payments are already final and don't need a backup path.
pub async fn backup_dump(Extension(ctx): Extension<AdminContext>) -> impl IntoResponse {
    let candidates = match ctx.storage.list_candidates().await {
        Ok(v) => v,
        Err(e) => return err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let immature = match ctx.storage.list_immature().await {
        Ok(v) => v,
        Err(e) => return err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let pending_payments = match ctx.storage.list_pending_payments().await {
        Ok(v) => v,
        Err(e) => return err_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    Json(json!({
        "candidates": candidates,
        "immature": immature,
        "pending_payments": pending_payments,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tos_pool_payout::{PayoutConfig, PayoutEngine};
    use tos_pool_storage::MemoryStorage;
    use tos_pool_upstream::{CoordinatorConfig, UpstreamCoordinator};
    use tos_pool_wallet::WalletClient;

    fn context() -> AdminContext {
        let storage: Arc<dyn tos_pool_storage::Storage> = Arc::new(MemoryStorage::new());
        let upstream = Arc::new(
            UpstreamCoordinator::new(
                Vec::new(),
                CoordinatorConfig {
                    health_check_interval: Duration::from_secs(15),
                    max_failures: 3,
                    recovery_threshold: 2,
                },
            )
            .unwrap(),
        );
        let wallet = Arc::new(
            WalletClient::new("http://127.0.0.1:1", Duration::from_secs(5), None).unwrap(),
        );
        let payout = Arc::new(PayoutEngine::new(
            storage.clone(),
            wallet,
            PayoutConfig {
                threshold: 1_000_000_000,
                withdrawal_fee_fixed: 1_000_000,
                withdrawal_fee_rate: 0.0,
                max_addresses_per_tx: 50,
                lock_ttl_secs: 120,
                wallet_max_attempts: 3,
                reconcile_grace_secs: 600,
            },
        ));
        AdminContext { storage, upstream, payout, admin_token: "secret".into() }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejects_malformed_address_with_bad_request() {
        let ctx = context();
        let resp = is_blacklisted(Extension(ctx), Path("x".into())).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blacklist_round_trip_through_handlers() {
        let ctx = context();
        let addr = "tos1aaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string();

        let resp = is_blacklisted(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["blacklisted"], json!(false));

        let resp = blacklist(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["blacklisted"], json!(true));

        let resp = is_blacklisted(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["blacklisted"], json!(true));

        let resp = unblacklist(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["blacklisted"], json!(false));
    }

    #[tokio::test]
    async fn whitelist_round_trip_is_independent_of_blacklist() {
        let ctx = context();
        let addr = "tos1bbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string();

        blacklist(Extension(ctx.clone()), Path(addr.clone())).await;

        let resp = whitelist(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["whitelisted"], json!(true));

        let resp = is_blacklisted(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["blacklisted"], json!(true), "whitelisting must not clear the blacklist entry");

        let resp = unwhitelist(Extension(ctx.clone()), Path(addr.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["whitelisted"], json!(false));
    }

    #[tokio::test]
    async fn pending_payouts_reports_empty_storage_and_engine_status() {
        let ctx = context();
        let resp = pending_payouts(Extension(ctx)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["pending"], json!([]));
        assert_eq!(body["last_run"]["last_run_paid_miners"], json!(0));
    }

    #[tokio::test]
    async fn upstream_status_with_no_configured_nodes_is_an_empty_list() {
        let ctx = context();
        let resp = upstream_status(Extension(ctx)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["upstreams"], json!([]));
    }

    #[tokio::test]
    async fn backup_dump_reports_empty_snapshot_on_a_fresh_pool() {
        let ctx = context();
        let resp = backup_dump(Extension(ctx)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["candidates"], json!([]));
        assert_eq!(body["immature"], json!([]));
        assert_eq!(body["pending_payments"], json!([]));
    }
}
