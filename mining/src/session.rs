//! Session Manager (C5) shared state: the session table and per-session
//! outbound sink, common to all three wire variants (spec §4.5).
//!
//! Per-session mutable state belongs to the session's own connection task;
//! other components reach it by id through the table rather than holding a
//! back-pointer that could outlive it (spec §9).

use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tos_pool_core::{Session, SessionId};

/// Outbound messages are raw, already-framed strings (a JSON-RPC line, a
/// WebSocket text frame body) so the session table stays protocol-agnostic.
pub struct SessionHandle {
    pub state: Mutex<Session>,
    pub outbound: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn insert(&self, id: SessionId, handle: Arc<SessionHandle>) {
        self.sessions.lock().await.insert(id, handle);
    }

    pub async fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await.remove(&id)
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    pub async fn broadcast(&self, message: &str) {
        let sessions = self.sessions.lock().await;
        for handle in sessions.values() {
            let _ = handle.outbound.try_send(message.to_string());
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Generates a pool-unique hex extranonce1; width is a small, fixed number
/// of bytes shared across sessions (spec §4.5 "assigned extranonce1").
pub fn generate_extranonce1(width_bytes: usize) -> String {
    let mut buf = vec![0u8; width_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn new_session(
    id: SessionId,
    peer_addr: SocketAddr,
    extranonce1: String,
    extranonce2_size: usize,
    initial_difficulty: f64,
    now: u64,
) -> Session {
    Session::new(id, peer_addr, extranonce1, extranonce2_size, initial_difficulty, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extranonce1_has_expected_hex_width() {
        assert_eq!(generate_extranonce1(4).len(), 8);
    }

    #[tokio::test]
    async fn table_insert_get_remove_roundtrip() {
        let table = SessionTable::new();
        let id = table.next_session_id();
        let (tx, _rx) = mpsc::channel(8);
        let session = new_session(id, "127.0.0.1:1".parse().unwrap(), "ab".into(), 4, 1.0, 0);
        let handle = Arc::new(SessionHandle { state: Mutex::new(session), outbound: tx });
        table.insert(id, handle).await;
        assert_eq!(table.len().await, 1);
        assert!(table.get(id).await.is_some());
        table.remove(id).await;
        assert_eq!(table.len().await, 0);
    }
}
