//! Stopping the listener and draining socket sessions.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Grace period used when the caller gives none.
const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Owns the shutdown signal and tracks every live session so shutdown can
/// wait for their close frames to go out.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token every session watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wrap a session future so [`graceful_shutdown`](Self::graceful_shutdown)
    /// waits for it.
    pub fn track<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Sessions still running.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then wait up to `grace` for the listener `handles`
    /// and all tracked sessions.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, grace: Option<Duration>) {
        let grace = grace.unwrap_or(DEFAULT_GRACE);
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            listeners = handles.len(),
            sessions = self.sessions.len(),
            grace_secs = grace.as_secs(),
            "draining"
        );

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            self.sessions.wait().await;
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                sessions = self.sessions.len(),
                "grace period elapsed with sessions still open"
            );
        }
    }
}
