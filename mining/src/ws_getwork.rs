//! WebSocket-GetWork wire variant (spec §4.5/§6): WebSocket transport,
//! JSON-RPC with object params instead of Stratum's array params. Same
//! session contract as [`crate::stratum`], driven through
//! [`crate::protocol::ProtocolHandler`].

use crate::protocol::{ProtocolHandler, SubmitError, SubmitResult};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tos_pool_core::Job;
use tos_pool_util::now_secs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WsGetworkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WsGetworkConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout_secs: u64,
    pub initial_grace_secs: u64,
    pub housekeeping_interval: Duration,
}

pub async fn run(
    handler: Arc<ProtocolHandler>,
    config: WsGetworkConfig,
    job_rx: watch::Receiver<Option<Arc<Job>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WsGetworkError> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "ws-getwork listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("ws-getwork shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if handler.bans.is_banned(peer_addr.ip(), now_secs()) {
                    continue;
                }
                if !handler.bans.register_connection(peer_addr.ip()) {
                    debug!(peer = %peer_addr, "connection cap reached, rejecting");
                    continue;
                }
                let handler = handler.clone();
                let config = config.clone();
                let job_rx = job_rx.clone();
                tokio::spawn(async move {
                    handle_connection(handler, config, socket, peer_addr, job_rx).await;
                });
            }
        }
    }
}

async fn handle_connection(
    handler: Arc<ProtocolHandler>,
    config: WsGetworkConfig,
    socket: TcpStream,
    peer_addr: SocketAddr,
    mut job_rx: watch::Receiver<Option<Arc<Job>>>,
) {
    let ws = match tokio_tungstenite::accept_async(socket).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "websocket handshake failed");
            handler.bans.release_connection(peer_addr.ip());
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (session_id, extranonce1, session, mut outbound_rx) = handler.accept_session(peer_addr).await;
    let extranonce2_size = session.state.lock().await.extranonce2_size;

    let mut housekeeping = time::interval(config.housekeeping_interval);
    let connected_at = now_secs();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(peer = %peer_addr, error = %e, "websocket read error");
                        break;
                    }
                };
                match process_message(&handler, &session, session_id, peer_addr, &msg, &extranonce1, extranonce2_size).await {
                    Some(reply) => {
                        if ws_tx.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            changed = job_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(job) = job_rx.borrow().clone() {
                    handler.note_new_job(job.clone()).await;
                    if session.state.lock().await.is_authorized() {
                        let _ = ws_tx.send(Message::Text(notify_message(&job))).await;
                    }
                }
            }
            _ = housekeeping.tick() => {
                let now = now_secs();
                let (last_share_at, authorized) = {
                    let state = session.state.lock().await;
                    (state.last_share_at, state.is_authorized())
                };
                if !authorized && now.saturating_sub(connected_at) > config.initial_grace_secs {
                    break;
                }
                if now.saturating_sub(last_share_at) > config.idle_timeout_secs {
                    break;
                }
                if let Some(new_d) = handler.maybe_retarget(&session, now).await {
                    let _ = ws_tx.send(Message::Text(set_difficulty_message(new_d))).await;
                }
            }
            Some(message) = outbound_rx.recv() => {
                if ws_tx.send(Message::Text(message)).await.is_err() {
                    break;
                }
            }
        }
    }

    handler.remove_session(session_id, peer_addr.ip()).await;
    handler.forget_session_dedup(session_id).await;
    info!(peer = %peer_addr, "ws-getwork connection closed");
}

/// Returns `None` if the connection should be closed, `Some(reply)` otherwise.
async fn process_message(
    handler: &Arc<ProtocolHandler>,
    session: &Arc<crate::session::SessionHandle>,
    session_id: tos_pool_core::SessionId,
    peer_addr: SocketAddr,
    text: &str,
    extranonce1: &str,
    extranonce2_size: usize,
) -> Option<String> {
    let now = now_secs();
    let request: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            handler.bans.record_malformed_json(peer_addr.ip(), now);
            return Some(error_response(Value::Null, 20, "malformed request"));
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));

    match method {
        "subscribe" => {
            let reply = json!({
                "id": id,
                "result": { "extranonce1": extranonce1, "extranonce2_size": extranonce2_size },
                "error": null,
            });
            let difficulty = session.state.lock().await.difficulty;
            let _ = session.outbound.try_send(set_difficulty_message(difficulty));
            if let Some(job) = handler.current_job().await {
                let _ = session.outbound.try_send(notify_message(&job));
            }
            Some(reply.to_string())
        }
        "authorize" => {
            let worker_name = params.get("worker").and_then(Value::as_str).unwrap_or("");
            match handler.authorize(session, worker_name, now).await {
                Ok(()) => Some(json!({"id": id, "result": true, "error": null}).to_string()),
                Err(()) => None,
            }
        }
        "submit" => {
            let job_id = params.get("job_id").and_then(Value::as_str).unwrap_or("").to_string();
            let extranonce2_hex = params.get("extranonce2").and_then(Value::as_str).unwrap_or("").to_string();
            let nonce_hex = params.get("nonce").and_then(Value::as_str).unwrap_or("").to_string();

            match handler.submit(session, peer_addr.ip(), &job_id, &extranonce2_hex, &nonce_hex, now).await {
                SubmitResult::Accepted { .. } => Some(json!({"id": id, "result": true, "error": null}).to_string()),
                SubmitResult::Rejected(SubmitError::Unauthorized) => None,
                SubmitResult::Rejected(SubmitError::TrustViolation) => None,
                SubmitResult::Rejected(SubmitError::Invalid(reason)) => {
                    Some(error_response(id, reason.code, reason.message))
                }
            }
        }
        other => {
            debug!(peer = %peer_addr, method = other, "unknown ws-getwork method");
            let _ = session_id;
            Some(error_response(id, 20, "unknown method"))
        }
    }
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    json!({ "id": id, "result": null, "error": { "code": code, "message": message } }).to_string()
}

fn notify_message(job: &Job) -> String {
    json!({
        "id": null,
        "method": "notify",
        "params": {
            "job_id": job.id,
            "header": job.header_hex(),
            "target": job.target_hex(),
            "height": job.height,
            "clean_jobs": job.clean_jobs,
        },
    })
    .to_string()
}

fn set_difficulty_message(difficulty: f64) -> String {
    json!({ "id": null, "method": "set_difficulty", "params": { "difficulty": difficulty } }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_uses_object_params() {
        let job = Job {
            id: "j1".into(),
            height: 10,
            header_prefix: vec![0u8; 112],
            target: [0xffu8; 32],
            difficulty: 1,
            clean_jobs: false,
            created_at: 0,
            opaque_template: None,
        };
        let msg = notify_message(&job);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert!(v["params"].is_object());
        assert_eq!(v["params"]["job_id"], "j1");
    }
}
