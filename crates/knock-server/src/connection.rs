//! One live socket as seen by the relay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use knock_core::{ConnectionId, Outbound, Role, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Work item for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outgoing {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// A registered client. Everything sent to it goes through a bounded channel
/// drained by the socket writer; nothing here blocks.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub role: Role,
    tx: mpsc::Sender<Outgoing>,
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat tick.
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    pub fn new(user_id: UserId, role: Role, tx: mpsc::Sender<Outgoing>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id,
            role,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Serialize `frame` and queue it. Returns `false` when the frame was
    /// dropped (channel full or closed).
    pub fn send(&self, frame: &Outbound) -> bool {
        match frame.to_json() {
            Ok(json) => self.enqueue(Outgoing::Text(json)),
            Err(e) => {
                tracing::error!(error = %e, conn_id = %self.id, "failed to serialize frame");
                false
            }
        }
    }

    /// Queue a ping for the writer.
    pub fn ping(&self) -> bool {
        self.enqueue(Outgoing::Ping)
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.enqueue(Outgoing::Close {
            code,
            reason: reason.into(),
        })
    }

    fn enqueue(&self, item: Outgoing) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(conn_id = %self.id, user_id = %self.user_id, dropped, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record client activity (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Return whether the client was active since the last call, and reset.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
