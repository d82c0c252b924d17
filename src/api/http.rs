//! HTTP API Server
//!
//! REST surface for the presentation layer: sessions, writes, commit and
//! rollback, reads, pending replications and node health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::connection::IsolationLevel;
use crate::error::{Error, Result};
use crate::log::OpKind;
use crate::record::{Fields, Value};
use crate::replication::{WriteCoordinator, WriteRequest};
use crate::session::Session;

/// Shared application state
pub struct AppState {
    /// Write coordinator
    pub coordinator: Arc<WriteCoordinator>,
    /// Open sessions by id
    pub sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
}

impl AppState {
    /// Close every session idle for at least `idle`.
    ///
    /// Sessions locked by an in-flight request are skipped. Returns how many
    /// sessions were removed.
    pub async fn reap_idle(&self, idle: Duration) -> usize {
        let expired: Vec<(Uuid, OwnedMutexGuard<Session>)> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<_> = sessions
                .iter()
                .filter_map(|(id, session)| {
                    let guard = Arc::clone(session).try_lock_owned().ok()?;
                    (guard.idle_for() >= idle).then_some((*id, guard))
                })
                .collect();
            for (id, _) in &expired {
                sessions.remove(id);
            }
            expired
        };

        let count = expired.len();
        for (id, mut session) in expired {
            match self.coordinator.close_session(&mut session).await {
                Ok(()) => tracing::info!("Closed session {} after {:?} idle", id, idle),
                Err(e) => tracing::warn!("Closing idle session {} failed: {}", id, e),
            }
        }
        count
    }

    /// Reap idle sessions every `every` until `shutdown` flips to true
    pub fn spawn_reaper(
        self: Arc<Self>,
        idle: Duration,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            tracing::info!("Closing sessions idle for {:?}, checked every {:?}", idle, every);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.reap_idle(idle).await;
                        if reaped > 0 {
                            tracing::debug!("Reaped {} idle sessions", reaped);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Session reaper stopped");
        })
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, coordinator: Arc<WriteCoordinator>) -> Self {
        let state = Arc::new(AppState {
            coordinator,
            sessions: RwLock::new(HashMap::new()),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            // Sessions
            .route("/sessions", post(handle_open_session))
            .route("/sessions/:id", get(handle_session_info).delete(handle_close_session))
            .route("/sessions/:id/writes", post(handle_write))
            .route("/sessions/:id/commit", post(handle_commit))
            .route("/sessions/:id/rollback", post(handle_rollback))
            .route("/sessions/:id/records/:key", get(handle_read))
            // Replication
            .route("/replication/pending/:node", get(handle_pending))
            .route("/replication/retry/:node", post(handle_retry))
            // Status
            .route("/nodes/health", get(handle_node_health))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Open session request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OpenSessionRequest {
    pub node: Option<String>,
    pub isolation: Option<IsolationLevel>,
}

/// Session description
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub node: String,
    pub isolation: IsolationLevel,
    pub transaction_node: Option<String>,
    pub staged_writes: usize,
}

impl SessionResponse {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            node: session.node().to_string(),
            isolation: session.isolation(),
            transaction_node: session.transaction_node().map(str::to_string),
            staged_writes: session.staged().len(),
        }
    }
}

/// Write request as sent by clients; field values are plain JSON
#[derive(Debug, Deserialize, Serialize)]
pub struct WriteBody {
    pub op: OpKind,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub statement: Option<String>,
}

impl WriteBody {
    fn into_request(self) -> Result<WriteRequest> {
        let mut fields = Fields::new();
        for (name, json) in &self.fields {
            let value = Value::from_json(json).ok_or_else(|| {
                Error::Validation(format!("field {} must be a scalar", name))
            })?;
            fields.insert(name.clone(), value);
        }

        Ok(WriteRequest {
            op: self.op,
            key: self.key,
            fields,
            statement: self.statement,
        })
    }
}

/// Record lookup options
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub node: Option<String>,
}

/// Rollback response
#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub rolled_back: bool,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub open_sessions: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::RecordNotFound(_) | Error::UnknownNode(_) => StatusCode::NOT_FOUND,
        Error::RangeExhausted { .. } | Error::SessionBusy { .. } => StatusCode::CONFLICT,
        Error::LocalWriteFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::NodeUnreachable { .. } | Error::LogWriteFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> Response {
    (
        status_for(&error),
        Json(ErrorResponse {
            code: error.code().to_string(),
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn unknown_session(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Unknown session: {}", id),
            code: "UNKNOWN_SESSION".to_string(),
        }),
    )
        .into_response()
}

async fn find_session(state: &AppState, id: Uuid) -> std::result::Result<Arc<Mutex<Session>>, Response> {
    state
        .sessions
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| unknown_session(id))
}

/// Lock a session for a request and mark it used.
///
/// Fails if the session was closed while the request waited for the lock.
async fn lock_session(state: &AppState, id: Uuid) -> std::result::Result<OwnedMutexGuard<Session>, Response> {
    let session = find_session(state, id).await?;
    let mut guard = Arc::clone(&session).lock_owned().await;

    let still_open = state
        .sessions
        .read()
        .await
        .get(&id)
        .is_some_and(|current| Arc::ptr_eq(current, &session));
    if !still_open {
        return Err(unknown_session(id));
    }

    guard.touch();
    Ok(guard)
}

// ============ Handlers ============

async fn handle_open_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<OpenSessionRequest>>,
) -> Response {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let session = match state
        .coordinator
        .open_session(req.node.as_deref(), req.isolation)
    {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };

    let response = SessionResponse::from_session(&session);
    tracing::info!("Opened session {} on {}", response.session_id, response.node);
    state
        .sessions
        .write()
        .await
        .insert(session.id(), Arc::new(Mutex::new(session)));

    (StatusCode::CREATED, Json(response)).into_response()
}

async fn handle_session_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let session = match lock_session(&state, id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Json(SessionResponse::from_session(&session)).into_response()
}

async fn handle_close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(session) = state.sessions.write().await.remove(&id) else {
        return unknown_session(id);
    };

    let mut session = session.lock().await;
    match state.coordinator.close_session(&mut session).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<WriteBody>,
) -> Response {
    let mut session = match lock_session(&state, id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let request = match body.into_request() {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    match state.coordinator.submit_write(&mut session, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            tracing::debug!("Write in session {} failed: {}", id, e);
            error_response(e)
        }
    }
}

async fn handle_commit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let mut session = match lock_session(&state, id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match state.coordinator.commit_session(&mut session).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let mut session = match lock_session(&state, id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match state.coordinator.rollback_session(&mut session).await {
        Ok(()) => Json(RollbackResponse { rolled_back: true }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_read(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(Uuid, String)>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let mut session = match lock_session(&state, id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match state
        .coordinator
        .read(&mut session, query.node.as_deref(), &key)
        .await
    {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(Error::RecordNotFound(key)),
        Err(e) => error_response(e),
    }
}

async fn handle_pending(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Response {
    match state.coordinator.list_pending_replications(&node).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_retry(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Response {
    match state.coordinator.retry_pending(&node).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_node_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.coordinator.node_health().await)
}

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.coordinator.default_node().to_string(),
        open_sessions: state.sessions.read().await.len(),
    })
}
