//! Stratum wire variant (spec §4.5/§6): TCP, newline-delimited JSON-RPC,
//! array params. Framing only — all business logic lives in
//! [`crate::protocol::ProtocolHandler`].

use crate::protocol::{ProtocolHandler, SubmitError, SubmitResult};
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tos_pool_core::{Job, SessionId};
use tos_pool_util::now_secs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StratumError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StratumConfig {
    pub bind_addr: SocketAddr,
    /// Read-buffer cap; a line past this bans the peer and disconnects
    /// (spec §4.5 "defeats line-flooding DoS").
    pub max_line_bytes: usize,
    pub idle_timeout_secs: u64,
    pub initial_grace_secs: u64,
    pub housekeeping_interval: Duration,
}

pub async fn run(
    handler: Arc<ProtocolHandler>,
    config: StratumConfig,
    job_rx: watch::Receiver<Option<Arc<Job>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StratumError> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "stratum listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("stratum shutting down");
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
    config: StratumConfig,
    socket: TcpStream,
    peer_addr: SocketAddr,
    mut job_rx: watch::Receiver<Option<Arc<Job>>>,
) {
    let (session_id, extranonce1, session, mut outbound_rx) = handler.accept_session(peer_addr).await;
    let extranonce2_size = {
        let state = session.state.lock().await;
        state.extranonce2_size
    };

    let (reader, writer) = socket.into_split();
    let lines_codec = LinesCodec::new_with_max_length(config.max_line_bytes);
    let mut reader = FramedRead::new(reader, lines_codec);
    let mut writer = BufWriter::new(writer);

    let mut housekeeping = time::interval(config.housekeeping_interval);
    let connected_at = now_secs();

    loop {
        tokio::select! {
            line = reader.next() => {
                let line = match line {
                    Some(Ok(l)) => l,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(peer = %peer_addr, "line exceeded read-buffer cap, banning");
                        handler.bans.ban_for_flood(peer_addr.ip(), now_secs());
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer_addr, error = %e, "connection read error");
                        break;
                    }
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                if !process_line(&handler, &session, session_id, peer_addr, &line, &extranonce1, extranonce2_size).await {
                    break;
                }
            }
            changed = job_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(job) = job_rx.borrow().clone() {
                    handler.note_new_job(job.clone()).await;
                    let is_authorized = session.state.lock().await.is_authorized();
                    if is_authorized {
                        send_notify(&mut writer, &job).await;
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
                    debug!(peer = %peer_addr, "no authorize within initial grace, closing");
                    break;
                }
                if now.saturating_sub(last_share_at) > config.idle_timeout_secs {
                    debug!(peer = %peer_addr, "idle timeout, closing");
                    break;
                }
                if let Some(new_d) = handler.maybe_retarget(&session, now).await {
                    send_set_difficulty(&mut writer, new_d).await;
                }
            }
            Some(message) = outbound_rx.recv() => {
                if write_line(&mut writer, &message).await.is_err() {
                    break;
                }
            }
        }
    }

    handler.remove_session(session_id, peer_addr.ip()).await;
    handler.forget_session_dedup(session_id).await;
    info!(peer = %peer_addr, "stratum connection closed");
}

/// Returns `false` if the connection should be closed.
async fn process_line(
    handler: &Arc<ProtocolHandler>,
    session: &Arc<crate::session::SessionHandle>,
    session_id: SessionId,
    peer_addr: SocketAddr,
    line: &str,
    extranonce1: &str,
    extranonce2_size: usize,
) -> bool {
    let now = now_secs();
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            handler.bans.record_malformed_json(peer_addr.ip(), now);
            let _ = session.outbound.try_send(error_response(Value::Null, 20, "malformed request").to_string());
            return true;
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));
    let params = match params.as_array() {
        Some(p) => p.clone(),
        None => {
            handler.bans.record_malformed_json(peer_addr.ip(), now);
            let _ = session.outbound.try_send(error_response(id, 20, "malformed params").to_string());
            return true;
        }
    };

    match method {
        "mining.subscribe" => {
            let sub_id = format!("{:x}", session_id);
            let reply = json!({
                "id": id,
                "result": [
                    [["mining.notify", sub_id], ["mining.set_difficulty", sub_id]],
                    extranonce1,
                    extranonce2_size,
                ],
                "error": null,
            });
            let _ = session.outbound.try_send(reply.to_string());
            let difficulty = session.state.lock().await.difficulty;
            let _ = session.outbound.try_send(set_difficulty_message(difficulty));
            if let Some(job) = handler.current_job().await {
                let _ = session.outbound.try_send(notify_message(&job));
            }
            true
        }
        "mining.authorize" => {
            let worker_name = params.first().and_then(Value::as_str).unwrap_or("");
            match handler.authorize(session, worker_name, now).await {
                Ok(()) => {
                    let _ = session.outbound.try_send(json!({"id": id, "result": true, "error": null}).to_string());
                    true
                }
                Err(()) => {
                    let _ = session.outbound.try_send(error_response(id, 24, "unauthorized worker").to_string());
                    false
                }
            }
        }
        "mining.submit" => {
            let worker = params.first().and_then(Value::as_str).unwrap_or("").to_string();
            let job_id = params.get(1).and_then(Value::as_str).unwrap_or("").to_string();
            let extranonce2_hex = params.get(2).and_then(Value::as_str).unwrap_or("").to_string();
            // Accept both the 4-element (worker, jobId, extranonce2, nonce) and
            // 5-element (worker, jobId, extranonce2, ntime, nonce) shapes; ntime
            // is not part of this pool's header framing (spec §6).
            let nonce_hex = if params.len() >= 5 {
                params.get(4).and_then(Value::as_str).unwrap_or("").to_string()
            } else {
                params.get(3).and_then(Value::as_str).unwrap_or("").to_string()
            };
            let _ = worker;

            match handler.submit(session, peer_addr.ip(), &job_id, &extranonce2_hex, &nonce_hex, now).await {
                SubmitResult::Accepted { .. } => {
                    let _ = session.outbound.try_send(json!({"id": id, "result": true, "error": null}).to_string());
                    true
                }
                SubmitResult::Rejected(SubmitError::Unauthorized) => {
                    let _ = session.outbound.try_send(error_response(id, 24, "unauthorized worker").to_string());
                    false
                }
                SubmitResult::Rejected(SubmitError::TrustViolation) => {
                    let _ = session.outbound.try_send(error_response(id, 26, "trust violation").to_string());
                    false
                }
                SubmitResult::Rejected(SubmitError::Invalid(reason)) => {
                    let _ = session.outbound.try_send(error_response(id, reason.code, reason.message).to_string());
                    true
                }
            }
        }
        other => {
            debug!(peer = %peer_addr, method = other, "unknown stratum method");
            let _ = session.outbound.try_send(error_response(id, 20, "unknown method").to_string());
            true
        }
    }
}

fn error_response(id: Value, code: i32, message: &str) -> Value {
    json!({ "id": id, "result": null, "error": [code, message, null] })
}

fn notify_message(job: &Job) -> String {
    json!({
        "id": null,
        "method": "mining.notify",
        "params": [job.id, job.header_hex(), job.target_hex(), job.height, job.clean_jobs],
    })
    .to_string()
}

fn set_difficulty_message(difficulty: f64) -> String {
    json!({ "id": null, "method": "mining.set_difficulty", "params": [difficulty] }).to_string()
}

async fn send_notify<W: AsyncWriteExt + Unpin>(writer: &mut BufWriter<W>, job: &Job) {
    let _ = write_line(writer, &notify_message(job)).await;
}

async fn send_set_difficulty<W: AsyncWriteExt + Unpin>(writer: &mut BufWriter<W>, difficulty: f64) {
    let _ = write_line(writer, &set_difficulty_message(difficulty)).await;
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut BufWriter<W>, message: &str) -> std::io::Result<()> {
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: "job-1".into(),
            height: 100,
            header_prefix: vec![0u8; 112],
            target: [0xffu8; 32],
            difficulty: 1_000_000,
            clean_jobs: true,
            created_at: 0,
            opaque_template: None,
        }
    }

    #[test]
    fn notify_params_match_wire_shape() {
        let msg = notify_message(&sample_job());
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["method"], "mining.notify");
        let params = v["params"].as_array().unwrap();
        assert_eq!(params.len(), 5);
        assert_eq!(params[0], "job-1");
        assert_eq!(params[1].as_str().unwrap().len(), 224);
        assert_eq!(params[2].as_str().unwrap().len(), 64);
        assert_eq!(params[3], 100);
        assert_eq!(params[4], true);
    }

    #[test]
    fn set_difficulty_is_single_positional_value() {
        let msg = set_difficulty_message(12.5);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["params"].as_array().unwrap().len(), 1);
        assert_eq!(v["params"][0], 12.5);
    }
}
