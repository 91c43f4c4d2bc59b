//! `KnockServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use knock_core::constants::BANNER;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::handshake::{wants_upgrade, HandshakeParams};
use crate::health::{self, HealthResponse};
use crate::relay::Relay;
use crate::session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<ServerConfig>,
    /// Shutdown signal and session tracker.
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

/// The relay server: routes, listener and shutdown handle.
pub struct KnockServer {
    config: Arc<ServerConfig>,
    relay: Arc<Relay>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl KnockServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown. Returns the bound
    /// address and the serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, "knock relay listening");
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET / and /ws: plain requests get the banner; upgrade requests are
/// validated before the handshake completes.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<HandshakeParams>, QueryRejection>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !wants_upgrade(&headers) {
        return (StatusCode::OK, BANNER).into_response();
    }

    let params = params.map(|Query(p)| p).unwrap_or_default();
    let handshake = match params.validate() {
        Ok(handshake) => handshake,
        Err(e) => {
            debug!(error = %e, "handshake rejected");
            return e.into_response();
        }
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            let token = state.shutdown.token();
            state.shutdown.track(session::run_session(
                socket,
                handshake,
                state.relay,
                state.config,
                token,
            ))
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.relay.registry()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use knock_store::MemoryKv;
    use tower::ServiceExt;

    use crate::config::RelayOptions;

    fn make_server() -> KnockServer {
        let relay = Relay::new(Arc::new(MemoryKv::new()), RelayOptions::default());
        KnockServer::new(ServerConfig::default(), Arc::new(relay))
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server().router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["hosts_online"], 0);
        assert_eq!(parsed["guests_online"], 0);
    }

    #[tokio::test]
    async fn plain_get_returns_banner() {
        for uri in ["/", "/ws", "/?id=h&role=host"] {
            let app = make_server().router();
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let resp = app.oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "for {uri}");
            assert_eq!(body_text(resp).await, BANNER);
        }
    }

    #[tokio::test]
    async fn upgrade_without_id_or_role_is_rejected() {
        for uri in ["/", "/ws?role=guest", "/?id=g1", "/?id=&role=guest"] {
            let app = make_server().router();
            let resp = app.oneshot(upgrade_request(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "for {uri}");
            assert_eq!(body_text(resp).await, "缺少ID或角色参数");
        }
    }

    #[tokio::test]
    async fn upgrade_with_unknown_role_is_rejected() {
        let app = make_server().router();
        let resp = app
            .oneshot(upgrade_request("/ws?id=x&role=admin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(resp).await, "未知角色参数");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server().router();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert!(addr.port() > 0);
        server
            .shutdown()
            .graceful_shutdown(vec![handle], Some(std::time::Duration::from_secs(5)))
            .await;
        assert!(server.shutdown().is_shutting_down());
    }
}
