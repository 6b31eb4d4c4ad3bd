//! WebSocket ingress for the relay.
//!
//! The server:
//! - Upgrades `GET /ws?user=<name>[&fcm_token=<token>]` to a WebSocket
//! - Records the client's push address before the session starts
//! - Spawns a `Connection` per socket, registered with the hub
//! - Reports hub counters on `GET /healthz`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │  axum Router    │
//! └───────┬─────────┘
//!         │ on_upgrade
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Connection    │────▶│    HubHandle    │
//! │  (per client)   │◀────│                 │
//! └─────────────────┘     └─────────────────┘
//!      queue (mpsc)
//! ```

mod connection;

pub use connection::{
    Connection, ConnectionError, ConnectionHandle, ConnectionSettings, CLOSE_REPLACED,
    CLOSE_TRY_AGAIN_LATER,
};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callhub_core::Username;

use crate::hub::HubHandle;
use crate::notify::TokenRegistry;

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8081));

/// State shared by every request handler.
#[derive(Clone)]
struct RelayState {
    hub: HubHandle,
    tokens: TokenRegistry,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user: Option<String>,
    pub fcm_token: Option<String>,
}

/// HTTP/WebSocket server for the relay.
pub struct RelayServer {
    /// Address to bind in `run`
    listen: SocketAddr,

    state: RelayState,
}

impl RelayServer {
    /// Creates a new relay server.
    ///
    /// # Arguments
    ///
    /// * `listen` - Address `run` binds to
    /// * `hub` - Handle to the session hub
    /// * `tokens` - Push address registry shared with the hub
    /// * `settings` - Per-connection tunables
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        listen: SocketAddr,
        hub: HubHandle,
        tokens: TokenRegistry,
        settings: ConnectionSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            listen,
            state: RelayState {
                hub,
                tokens,
                settings,
                shutdown: cancel_token,
            },
        }
    }

    /// Returns the configured listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.listen,
                error: e.to_string(),
            })?;

        self.serve(listener).await
    }

    /// Serves on an already-bound listener until the cancellation token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Serve(e.to_string()))?;
        info!(addr = %addr, "Relay server listening");

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Server shutdown requested");
            })
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        info!("Relay server stopped");
        Ok(())
    }

    /// Builds the request router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/healthz", get(healthz))
            .with_state(self.state.clone())
    }
}

/// GET /ws?user=NAME[&fcm_token=TOKEN]
async fn ws_upgrade(
    State(state): State<RelayState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user) = params.user.and_then(|u| Username::parse(u).ok()) else {
        debug!("Rejecting WebSocket upgrade without username");
        return (StatusCode::BAD_REQUEST, "username required").into_response();
    };

    if let Some(token) = params.fcm_token.filter(|t| !t.is_empty()) {
        debug!(user = %user, "Recorded push address");
        state.tokens.set(user.clone(), token);
    }

    ws.on_upgrade(move |socket| async move {
        let connection = Connection::new(
            user.clone(),
            state.hub,
            state.settings,
            state.shutdown,
        );

        match connection.run(socket).await {
            Ok(()) => debug!(user = %user, "Session ended"),
            Err(ConnectionError::Closed) => debug!(user = %user, "Client closed connection"),
            Err(ConnectionError::Evicted) => info!(user = %user, "Session replaced"),
            Err(e) => warn!(user = %user, error = %e, "Session ended with error"),
        }
    })
}

/// GET /healthz
async fn healthz(State(state): State<RelayState>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "online": stats.online,
            "in_call": stats.in_call,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            })),
        )
            .into_response(),
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Server error: {0}")]
    Serve(String),
}
