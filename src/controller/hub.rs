//! WebSocket session bookkeeping.
//!
//! Sessions are owned by the HTTP layer; everything else addresses them
//! through small integer connection ids handed out here. Id 0 is reserved
//! for broadcast. No handler ever holds a reference to a session object.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Reserved connection id addressing every session.
pub const BROADCAST_CONN_ID: u64 = 0;

/// Outbound buffer per session.
const SESSION_BUFFER: usize = 64;

/// Registry of live sessions keyed by connection id.
#[derive(Default)]
pub struct SessionHub {
    sessions: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    counter: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns its id and the outbound message stream.
    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let conn_id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions.lock().insert(conn_id, tx);
        debug!(conn_id, "session registered");
        (conn_id, rx)
    }

    pub fn unregister(&self, conn_id: u64) {
        self.sessions.lock().remove(&conn_id);
        debug!(conn_id, "session unregistered");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Send to one session, or to all when `conn_id` is
    /// [`BROADCAST_CONN_ID`]. Slow or gone sessions are skipped.
    pub async fn send(&self, conn_id: u64, message: &str) {
        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let sessions = self.sessions.lock();
            if conn_id == BROADCAST_CONN_ID {
                sessions.iter().map(|(id, tx)| (*id, tx.clone())).collect()
            } else {
                sessions.get(&conn_id).map(|tx| (conn_id, tx.clone())).into_iter().collect()
            }
        };
        for (id, tx) in targets {
            if tx.try_send(message.to_string()).is_err() {
                debug!(conn_id = id, "session send failed (slow or closed)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_send_unregister() {
        let hub = SessionHub::new();
        let (id1, mut rx1) = hub.register();
        let (id2, mut rx2) = hub.register();
        assert_ne!(id1, BROADCAST_CONN_ID);
        assert_ne!(id1, id2);
        assert_eq!(hub.session_count(), 2);

        hub.send(id1, "direct").await;
        assert_eq!(rx1.recv().await.unwrap(), "direct");

        hub.send(BROADCAST_CONN_ID, "everyone").await;
        assert_eq!(rx1.recv().await.unwrap(), "everyone");
        assert_eq!(rx2.recv().await.unwrap(), "everyone");

        hub.unregister(id1);
        assert_eq!(hub.session_count(), 1);
        hub.send(id1, "gone").await; // dropped silently
    }
}
