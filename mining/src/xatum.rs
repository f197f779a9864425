//! Xatum wire variant (spec §4.5/§6): TCP, newline-delimited JSON, object
//! params, TLS mandatory. Same session contract as [`crate::stratum`] and
//! [`crate::ws_getwork`], driven through [`crate::protocol::ProtocolHandler`].

use crate::protocol::{ProtocolHandler, SubmitError, SubmitResult};
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tos_pool_core::Job;
use tos_pool_util::now_secs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum XatumError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Tls(String),
}

#[derive(Debug, Clone)]
pub struct XatumConfig {
    pub bind_addr: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
    pub max_line_bytes: usize,
    pub idle_timeout_secs: u64,
    pub initial_grace_secs: u64,
    pub housekeeping_interval: Duration,
}

fn load_tls_acceptor(config: &XatumConfig) -> Result<TlsAcceptor, XatumError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;
    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| XatumError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, XatumError> {
    let file = std::fs::File::open(Path::new(path)).map_err(XatumError::Io)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| XatumError::Tls(e.to_string()))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey, XatumError> {
    let file = std::fs::File::open(Path::new(path)).map_err(XatumError::Io)?;
    let mut reader = std::io::BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|e| XatumError::Tls(e.to_string()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| XatumError::Tls("no private key found".into()))
}

pub async fn run(
    handler: Arc<ProtocolHandler>,
    config: XatumConfig,
    job_rx: watch::Receiver<Option<Arc<Job>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), XatumError> {
    let acceptor = load_tls_acceptor(&config)?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "xatum listening (tls mandatory)");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("xatum shutting down");
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
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(socket).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "tls handshake failed");
                            handler.bans.release_connection(peer_addr.ip());
                            return;
                        }
                    };
                    handle_connection(handler, config, tls_stream, peer_addr, job_rx).await;
                });
            }
        }
    }
}

async fn handle_connection(
    handler: Arc<ProtocolHandler>,
    config: XatumConfig,
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    peer_addr: SocketAddr,
    mut job_rx: watch::Receiver<Option<Arc<Job>>>,
) {
    let (session_id, _extranonce1, session, mut outbound_rx) = handler.accept_session(peer_addr).await;

    let (reader, writer) = tokio::io::split(stream);
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
                if !process_line(&handler, &session, peer_addr, &line, &mut writer).await {
                    break;
                }
            }
            changed = job_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(job) = job_rx.borrow().clone() {
                    handler.note_new_job(job.clone()).await;
                    if session.state.lock().await.is_authorized() {
                        let _ = write_line(&mut writer, &notify_message(&job)).await;
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
                    let _ = write_line(&mut writer, &set_difficulty_message(new_d)).await;
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
    info!(peer = %peer_addr, "xatum connection closed");
}

/// Returns `false` if the connection should be closed.
async fn process_line<W: AsyncWriteExt + Unpin>(
    handler: &Arc<ProtocolHandler>,
    session: &Arc<crate::session::SessionHandle>,
    peer_addr: SocketAddr,
    line: &str,
    writer: &mut BufWriter<W>,
) -> bool {
    let now = now_secs();
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            handler.bans.record_malformed_json(peer_addr.ip(), now);
            let _ = write_line(writer, &error_response(Value::Null, 20, "malformed request")).await;
            return true;
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));

    match method {
        "ping" => {
            let _ = write_line(writer, &json!({ "method": "pong", "id": id }).to_string()).await;
            true
        }
        "authorize" => {
            let worker_name = params.get("worker").and_then(Value::as_str).unwrap_or("");
            match handler.authorize(session, worker_name, now).await {
                Ok(()) => {
                    let _ = write_line(writer, &json!({"id": id, "result": true, "error": null}).to_string()).await;
                    true
                }
                Err(()) => {
                    let _ = write_line(writer, &error_response(id, 24, "unauthorized worker")).await;
                    false
                }
            }
        }
        "submit" => {
            let job_id = params.get("job_id").and_then(Value::as_str).unwrap_or("").to_string();
            let extranonce2_hex = params.get("extranonce2").and_then(Value::as_str).unwrap_or("").to_string();
            let nonce_hex = params.get("nonce").and_then(Value::as_str).unwrap_or("").to_string();

            match handler.submit(session, peer_addr.ip(), &job_id, &extranonce2_hex, &nonce_hex, now).await {
                SubmitResult::Accepted { .. } => {
                    let _ = write_line(writer, &json!({"id": id, "result": true, "error": null}).to_string()).await;
                    true
                }
                SubmitResult::Rejected(SubmitError::Unauthorized) => {
                    let _ = write_line(writer, &error_response(id, 24, "unauthorized worker")).await;
                    false
                }
                SubmitResult::Rejected(SubmitError::TrustViolation) => {
                    let _ = write_line(writer, &error_response(id, 26, "trust violation")).await;
                    false
                }
                SubmitResult::Rejected(SubmitError::Invalid(reason)) => {
                    let _ = write_line(writer, &error_response(id, reason.code, reason.message)).await;
                    true
                }
            }
        }
        other => {
            debug!(peer = %peer_addr, method = other, "unknown xatum method");
            let _ = write_line(writer, &error_response(id, 20, "unknown method")).await;
            true
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

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut BufWriter<W>, message: &str) -> std::io::Result<()> {
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
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
        assert_eq!(v["params"]["job_id"], "j1");
    }

    #[test]
    fn pong_echoes_request_id() {
        let id = json!(7);
        let reply = json!({ "method": "pong", "id": id });
        assert_eq!(reply["id"], 7);
    }
}
