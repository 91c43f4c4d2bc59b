//! Socket lifecycle for one upgraded connection, from open through close.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use knock_core::constants::MALFORMED_PAYLOAD;
use knock_core::Outbound;

use crate::config::ServerConfig;
use crate::connection::{Connection, Outgoing};
use crate::handshake::Handshake;
use crate::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::relay::{Relay, SessionState};

/// Close code sent when the server goes away or a client stops answering.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when the relay cannot set the session up.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long the writer gets to flush queued frames after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Run a socket session.
///
/// 1. Spawns the writer task draining the connection's outbound queue
/// 2. Opens the session with the relay (host verification, state push)
/// 3. Dispatches inbound text frames one at a time
/// 4. Pings via the heartbeat and drops unresponsive clients
/// 5. Unregisters on disconnect, timeout or shutdown
#[instrument(skip_all, fields(user_id = %handshake.user_id, role = %handshake.role, conn_id))]
pub async fn run_session(
    socket: WebSocket,
    handshake: Handshake,
    relay: Arc<Relay>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (send_tx, send_rx) = mpsc::channel::<Outgoing>(config.max_send_queue);
    let connection = Arc::new(Connection::new(
        handshake.user_id,
        handshake.role,
        send_tx,
    ));
    let _ = tracing::Span::current().record("conn_id", connection.id.as_str());
    debug!(state = ?SessionState::Connecting, "socket upgraded");

    let mut writer = tokio::spawn(write_loop(ws_tx, send_rx));

    match relay.open(&connection, handshake.password.as_ref()).await {
        Ok(SessionState::Active) => {}
        Ok(state) => {
            info!(?state, "session refused");
            drain_writer(writer).await;
            return;
        }
        Err(e) => {
            error!(error = %e, class = e.class(), "failed to open session");
            let _ = connection.send(&Outbound::Error {
                message: MALFORMED_PAYLOAD.into(),
            });
            let _ = connection.close(CLOSE_INTERNAL_ERROR, "");
            relay.close(&connection);
            drain_writer(writer).await;
            return;
        }
    }
    info!(state = ?SessionState::Active, "session active");

    let heartbeat_cancel = shutdown.child_token();
    let mut heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&connection),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        heartbeat_cancel.clone(),
    ));

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else { break };
                connection.mark_alive();
                let text = match frame {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(len = data.len(), "non-UTF8 binary frame ignored");
                            continue;
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("client sent close frame");
                        break;
                    }
                };
                relay.dispatch(&connection, &text).await;
            }
            result = &mut heartbeat => {
                if matches!(result, Ok(HeartbeatResult::TimedOut)) {
                    warn!(silent_for = ?connection.last_pong_elapsed(), "client unresponsive, disconnecting");
                    let _ = connection.close(CLOSE_GOING_AWAY, "heartbeat timeout");
                }
                break;
            }
            () = shutdown.cancelled() => {
                let _ = connection.close(CLOSE_GOING_AWAY, "server shutting down");
                break;
            }
            _ = &mut writer => {
                debug!("writer stopped");
                break;
            }
        }
    }

    heartbeat_cancel.cancel();
    relay.close(&connection);
    info!(
        duration_secs = connection.connected_at.elapsed().as_secs(),
        dropped = connection.drop_count(),
        "session ended"
    );
    if !writer.is_finished() {
        let _ = connection.close(CLOSE_GOING_AWAY, "");
        drain_writer(writer).await;
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outgoing>,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outgoing::Text(text) => ws_tx.send(Message::Text(text.into())).await,
            Outgoing::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
            Outgoing::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn drain_writer(mut writer: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("writer did not finish in time, aborting");
        writer.abort();
    }
}
