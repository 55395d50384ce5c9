use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use loom_core::backend::AgentBackend;
use loom_core::{ErrorKind, SessionId};
use loom_engine::{CoordinatorConfig, TurnCoordinator};
use loom_settings::LoomSettings;
use loom_store::{Database, EventLog, SessionRepo, StoreError};

use crate::api;
use crate::connection::HubConfig;
use crate::error::ApiError;
use crate::event_bridge;
use crate::hub::{self, SyncHub};
use crate::socket;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub request_timeout: Duration,
    pub staleness: Duration,
    pub ping_interval: Duration,
    pub max_missed_pings: u32,
    pub catch_up_page: u32,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
    pub queue_max_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&LoomSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &LoomSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
            request_timeout: settings.server.request_timeout(),
            staleness: settings.sync.staleness(),
            ping_interval: settings.sync.ping_interval(),
            max_missed_pings: settings.sync.max_missed_pings,
            catch_up_page: settings.sync.catch_up_page_size,
            history_default_limit: settings.sync.history_default_limit,
            history_max_limit: settings.sync.history_max_limit,
            queue_max_size: settings.queue.max_size,
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            staleness: self.staleness,
            max_send_queue: self.max_send_queue,
            catch_up_page: self.catch_up_page,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: TurnCoordinator,
    pub hub: Arc<SyncHub>,
    pub sessions: SessionRepo,
    pub log: EventLog,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database, backend: Arc<dyn AgentBackend>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = TurnCoordinator::new(
            db.clone(),
            backend,
            event_tx,
            CoordinatorConfig {
                queue_max_size: config.queue_max_size,
            },
        );
        let log = EventLog::new(db.clone());
        let hub = Arc::new(SyncHub::new(log.clone(), config.hub_config()));
        Self {
            coordinator,
            hub,
            sessions: SessionRepo::new(db),
            log,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let timeout = state.config.request_timeout;
    let api = Router::new()
        .route("/sessions", post(api::create_session).get(api::list_sessions))
        .route("/sessions/{id}", get(api::get_session).delete(api::delete_session))
        .route("/sessions/{id}/archive", post(api::archive_session))
        .route("/sessions/{id}/cancel", post(api::cancel))
        .route("/sessions/{id}/events", get(api::list_events))
        .route("/sessions/{id}/queue", get(api::list_queue).post(api::enqueue))
        .route("/sessions/{id}/queue/{prompt_id}", delete(api::remove_queued))
        .route("/sessions/{id}/queue/{prompt_id}/move", post(api::move_queued))
        .route("/sessions/{id}/ws", get(ws_handler))
        .layer(TimeoutLayer::new(timeout));

    Router::new()
        .route("/health", get(api::health))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    backend: Arc<dyn AgentBackend>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, db, backend);

    let bridge = event_bridge::create_bridge(Arc::clone(&state.hub), state.coordinator.subscribe());
    let reaper = hub::start_reaper(
        Arc::clone(&state.hub),
        state.config.ping_interval,
        state.config.max_missed_pings + 1,
    );

    match state.coordinator.resume_queues() {
        Ok(0) => {}
        Ok(n) => info!(sessions = n, "resumed queued prompts from previous run"),
        Err(e) => warn!(error = %e, "failed to resume queued prompts"),
    }

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "loom server started");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        state,
        shutdown,
        server,
        _bridge: bridge,
        _reaper: reaper,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _reaper: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.state.hub.detach_all();
        let _ = self.server.await;
        self._bridge.abort();
        self._reaper.abort();
        info!("loom server stopped");
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Creates the session under the requested id when it does not exist.
    pub workspace: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::from_raw(id);
    match state.sessions.get(&session_id) {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => match query.workspace {
            Some(workspace) => match state.sessions.create_with_id(&session_id, &workspace, None) {
                Ok(_) => info!(session_id = %session_id, workspace = %workspace, "session created on first connection"),
                // Another connection created it first.
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            },
            None => {
                return Err(ApiError::new(
                    ErrorKind::NotFound,
                    format!("session {session_id} not found"),
                ))
            }
        },
        Err(e) => return Err(e.into()),
    }

    Ok(ws
        .on_upgrade(move |socket| socket::handle_ws_connection(socket, session_id, state))
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_engine::ScriptedBackend;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = LoomSettings::default();
        settings.server.port = 9999;
        settings.sync.staleness_secs = 10;
        settings.queue.max_size = 2;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 9999);
        assert_eq!(config.staleness, Duration::from_secs(10));
        assert_eq!(config.queue_max_size, 2);
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let state = AppState::new(test_config(), db, Arc::new(ScriptedBackend::echo()));
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let db = Database::in_memory().unwrap();
        let handle = start(test_config(), db, Arc::new(ScriptedBackend::echo()))
            .await
            .unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        handle.shutdown().await;
    }
}
