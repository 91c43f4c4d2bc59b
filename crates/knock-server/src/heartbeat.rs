//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Ping `connection` every `interval` until it misses enough rounds to exceed
/// `timeout` or `cancel` fires.
///
/// Each tick first checks for activity since the previous tick, then queues a
/// fresh ping, so a client always has a full interval to answer.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis().div_ceil(interval_ms))
        .unwrap_or(u32::MAX)
        .max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                let _ = connection.ping();
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knock_core::{Role, UserId};
    use tokio::sync::mpsc;

    use crate::connection::Outgoing;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Arc::new(Connection::new(UserId::from("hb"), Role::Guest, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(
            conn,
            Duration::from_secs(100),
            Duration::from_secs(300),
            cancel,
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let (conn, mut rx) = make_connection();
        let result = run_heartbeat(
            conn,
            Duration::from_secs(10),
            Duration::from_secs(20),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        // The first tick still counted as alive and sent a ping.
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_client_stays_alive() {
        let (conn, mut rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            Duration::from_secs(10),
            Duration::from_secs(10),
            cancel.clone(),
        ));

        // Answer every ping, as a real client would.
        for _ in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), Outgoing::Ping);
            conn.mark_alive();
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }
}
