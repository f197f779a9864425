//! Admin / status HTTP surface (spec §6): blacklist and whitelist mutation,
//! upstream health view, pending-payout view, and a JSON backup dump. Not a
//! blockchain RPC API — the pool has no chain-query surface of its own, it
//! only reports on its own bookkeeping.

pub mod admin;

use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tos_pool_payout::PayoutEngine;
use tos_pool_storage::Storage;
use tos_pool_upstream::UpstreamCoordinator;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared handle every admin handler reads from.
#[derive(Clone)]
pub struct AdminContext {
    pub storage: Arc<dyn Storage>,
    pub upstream: Arc<UpstreamCoordinator>,
    pub payout: Arc<PayoutEngine>,
    pub admin_token: String,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_addr: SocketAddr,
    pub cors_domains: Vec<String>,
}

pub struct RpcServer {
    config: RpcConfig,
    context: AdminContext,
}

impl RpcServer {
    pub fn new(config: RpcConfig, context: AdminContext) -> Self {
        RpcServer { config, context }
    }

    pub async fn start(&self) -> Result<(), std::io::Error> {
        info!(addr = %self.config.bind_addr, "starting admin http server");

        let cors = if self.config.cors_domains.is_empty() {
            CorsLayer::new().allow_origin(Any)
        } else {
            let origins: Vec<_> = self
                .config
                .cors_domains
                .iter()
                .filter_map(|d| d.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(origins)
        };

        let admin_token = self.context.admin_token.clone();

        let app = Router::new()
            .route("/status", get(admin::upstream_status))
            .route("/payouts/pending", get(admin::pending_payouts))
            .route(
                "/blacklist/:address",
                get(admin::is_blacklisted)
                    .post(admin::blacklist)
                    .delete(admin::unblacklist),
            )
            .route(
                "/whitelist/:address",
                get(admin::is_whitelisted)
                    .post(admin::whitelist)
                    .delete(admin::unwhitelist),
            )
            .route("/backup", get(admin::backup_dump))
            .layer(middleware::from_fn(move |req: Request<axum::body::Body>, next: Next<axum::body::Body>| {
                let admin_token = admin_token.clone();
                async move { require_bearer_token(admin_token, req, next).await }
            }))
            .layer(cors)
            .layer(Extension(self.context.clone()));

        axum::Server::bind(&self.config.bind_addr)
            .serve(app.into_make_service())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

pub(crate) fn err_status(code: StatusCode, message: impl Into<String>) -> (StatusCode, axum::Json<serde_json::Value>) {
    (code, axum::Json(serde_json::json!({ "error": message.into() })))
}

async fn require_bearer_token(
    admin_token: String,
    req: Request<axum::body::Body>,
    next: Next<axum::body::Body>,
) -> Response {
    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == admin_token => next.run(req).await,
        _ => err_status(StatusCode::UNAUTHORIZED, "missing or invalid admin token").into_response(),
    }
}
