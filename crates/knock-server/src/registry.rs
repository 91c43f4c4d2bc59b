//! Live connections keyed by user id.

use std::sync::Arc;

use dashmap::DashMap;
use knock_core::{ConnectionId, Role, UserId};

use crate::connection::Connection;

/// At most one connection per user id. A second connect under the same id
/// replaces the first without telling it.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, returning the connection it displaced, if any.
    pub fn add(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.insert(conn.user_id.clone(), conn)
    }

    pub fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(user_id).map(|c| Arc::clone(c.value()))
    }

    /// Live connection for `user_id` if it speaks for `role`.
    pub fn lookup_role(&self, user_id: &str, role: Role) -> Option<Arc<Connection>> {
        self.lookup(user_id).filter(|c| c.role == role)
    }

    /// Remove `user_id` only while `conn_id` is still the registered
    /// connection. Returns whether anything was removed.
    pub fn remove(&self, user_id: &str, conn_id: &ConnectionId) -> bool {
        self.connections
            .remove_if(user_id, |_, c| &c.id == conn_id)
            .is_some()
    }

    /// Snapshot of every registered guest.
    pub fn guests(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().role == Role::Guest)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// The longest-connected guest other than connection `except`. Ties on
    /// the connect instant fall back to the time-ordered connection id.
    pub fn first_guest_except(&self, except: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().role == Role::Guest && &e.value().id != except)
            .min_by(|a, b| {
                let (a, b) = (a.value(), b.value());
                a.connected_at
                    .cmp(&b.connected_at)
                    .then_with(|| a.id.as_str().cmp(b.id.as_str()))
            })
            .map(|e| Arc::clone(e.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.connections
            .iter()
            .filter(|e| e.value().role == role)
            .count()
    }
}
