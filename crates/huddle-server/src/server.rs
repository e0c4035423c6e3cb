use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use huddle_core::SessionKey;
use huddle_room::RoomRegistry;
use huddle_telemetry::{MetricsRecorder, TelemetryGuard};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::client::{ClientSession, SessionObserver, SessionRegistry};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::{reconcile_session, ConnectionHandler};
use crate::session::{run_ws_session, Heartbeat};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        let rooms = Arc::new(RoomRegistry::new(config.room_cleanup));
        let observer = Arc::new(ServerObserver {
            rooms: Arc::clone(&rooms),
            metrics: metrics.clone(),
        });
        let sessions = Arc::new(SessionRegistry::new(
            config.max_send_queue,
            observer,
            metrics.clone(),
        ));
        Self {
            rooms,
            sessions,
            metrics,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Keeps connection metrics and reconciles rooms when a transport goes away.
struct ServerObserver {
    rooms: Arc<RoomRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionObserver for ServerObserver {
    fn on_open(&self, _session: &ClientSession) {
        if let Some(m) = &self.metrics {
            m.counter_inc("ws_connections_total", &[], 1);
            m.gauge_inc("ws_connections_active", &[], 1.0);
        }
    }

    fn on_failed(&self, session: &ClientSession, reason: &str) {
        tracing::warn!(session_key = %session.key(), reason, "session transport failed");
    }

    fn on_disconnected(&self, session: &ClientSession) {
        reconcile_session(session, &self.rooms, self.metrics.as_deref());
    }

    fn on_close(&self, _key: &SessionKey) {
        if let Some(m) = &self.metrics {
            m.gauge_inc("ws_connections_active", &[], -1.0);
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    pub state: AppState,
    server: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.state.rooms
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    /// Stop accepting connections, close open sessions and wait for the
    /// background tasks.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        let _ = self.reaper.await;
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("server stopped");
    }
}

/// Bind and start serving. Returns once the listener is bound.
pub async fn start(config: ServerConfig, telemetry: &TelemetryGuard) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, telemetry.metrics_handle());
    let reaper = spawn_reaper(&state);

    let router = build_router(state.clone());
    let shutdown = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    });

    tracing::info!(addr = %local_addr, "huddle server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        state,
        server,
        reaper,
    })
}

/// Periodically remove empty rooms until shutdown.
fn spawn_reaper(state: &AppState) -> JoinHandle<()> {
    let rooms = Arc::clone(&state.rooms);
    let metrics = state.metrics.clone();
    let shutdown = state.shutdown.clone();
    let period = state.config.reap_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = rooms.reap_empty();
                    if reaped > 0 {
                        tracing::info!(reaped, rooms = rooms.len(), "reaped empty rooms");
                        if let Some(m) = &metrics {
                            m.counter_inc("rooms_removed_total", &[], reaped as u64);
                        }
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (session, rx) = state.sessions.on_accept(Some(peer));
            let handler = ConnectionHandler::new(
                Arc::clone(&session),
                Arc::clone(&state.rooms),
                state.metrics.clone(),
            );
            let heartbeat = Heartbeat {
                interval: state.config.heartbeat_interval(),
                timeout: state.config.heartbeat_timeout(),
            };
            run_ws_session(
                socket,
                session,
                rx,
                handler,
                Arc::clone(&state.sessions),
                heartbeat,
                state.shutdown.clone(),
            )
            .await;
        })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "sessions": state.sessions.len(),
        "rooms": state.rooms.len(),
        "room_ids": state.rooms.room_ids(),
        "registry": state.rooms.stats(),
    }))
}

/// In-memory metrics snapshot. Live room count is sampled at read time.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state
        .metrics
        .as_ref()
        .map(|m| {
            m.gauge_set("rooms_active", &[], state.rooms.len() as f64);
            m.snapshot()
        })
        .unwrap_or_default();
    Json(snapshot)
}
