//! `/health` endpoint.

use std::time::Instant;

use knock_core::Role;
use serde::Serialize;

use crate::registry::ConnectionRegistry;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections of either role.
    pub connections: usize,
    pub hosts_online: usize,
    pub guests_online: usize,
}

/// Build a health response from the live registry.
pub fn health_check(start_time: Instant, registry: &ConnectionRegistry) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: registry.count(),
        hosts_online: registry.count_role(Role::Host),
        guests_online: registry.count_role(Role::Guest),
    }
}
