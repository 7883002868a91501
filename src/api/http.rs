//! HTTP API Server
//!
//! Directory requests, replica status, and the role hooks used by the
//! external coordinator.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::cache::CacheStats;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::gate::{Request, RequestGate, Response};
use crate::server::WorkerPool;
use crate::state::{Role, RoleTracker};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    pub role: Arc<RoleTracker>,
    pub gate: Arc<RequestGate>,
    pub pool: Arc<WorkerPool>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        gate: Arc<RequestGate>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            role: Arc::clone(gate.role()),
            gate,
            pool,
            started: Instant::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/request", post(handle_request))
            // Status and info
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            // Role hooks
            .route("/admin/promote", post(handle_promote))
            .route("/admin/demote", post(handle_demote))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub role: String,
    pub role_transitions: u64,
    pub uptime_seconds: u64,
    pub workers: usize,
    pub retries: u64,
    pub store: StoreStats,
    pub subject_cache: Option<CacheStats>,
    pub sessions: usize,
    pub logins: usize,
}

/// Calls that reached the backing store
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub connects: u64,
    pub pings: u64,
    pub statements: u64,
    pub transactions: u64,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
}

/// Role change response
#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub success: bool,
    pub role: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_request(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Request>,
) -> HttpResponse {
    match state.pool.submit(request).await {
        Ok(Response::Retry) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(Response::Retry),
        )
            .into_response(),
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::warn!("Request not executed: {}", e);
            let code = match e {
                Error::ShuttingDown => "SHUTTING_DOWN",
                _ => "INTERNAL",
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: code.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let directory = state.gate.directory();
    let counters = state.pool.counters();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        role: state.role.role().to_string(),
        role_transitions: state.role.transitions(),
        uptime_seconds: state.started.elapsed().as_secs(),
        workers: state.pool.workers(),
        retries: state.gate.retries(),
        store: StoreStats {
            connects: counters.connects(),
            pings: counters.pings(),
            statements: counters.statements(),
            transactions: counters.transactions(),
        },
        subject_cache: directory.subject_cache().map(|cache| cache.stats()),
        sessions: directory.sessions().sessions().size().await,
        logins: directory.sessions().logins().size().await,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        is_leader: state.role.is_leader(),
    })
}

async fn handle_promote(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.role.become_leader();
    Json(RoleResponse {
        success: true,
        role: Role::Leader.to_string(),
    })
}

async fn handle_demote(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.role.become_available();
    Json(RoleResponse {
        success: true,
        role: Role::Follower.to_string(),
    })
}
