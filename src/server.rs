//! HTTP trigger surface.
//!
//! Lets a scheduler, a CI job or a webhook relay start syncs without shell
//! access to the host.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sync?project_id=<id>&incremental=<bool>` | Run one sync, return its `RunResult` |
//! | `GET`  | `/projects` | Configured projects |
//! | `GET`  | `/projects/{id}/status` | Checkpoint summary and recent runs |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /sync` answers `200` with the `RunResult` when the run succeeded
//! and `500` with the same body when it did not. A second request for a
//! project that is already syncing fails fast instead of queueing.
//!
//! # Error Contract
//!
//! Errors that are not a `RunResult` use one shape:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "project 'x' is not configured" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reposync_core::models::{Project, RunResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::history;
use crate::setup::App;
use crate::status::{project_status, ProjectStatus};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Build the router. Split from [`run_server`] so tests can drive it
/// without binding a port.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sync", post(handle_sync))
        .route("/projects", get(handle_projects))
        .route("/projects/{id}/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { app })
}

/// Serve until Ctrl-C.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = router(app);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    println!("reposync server listening on http://{}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /projects ============

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
}

async fn handle_projects(State(state): State<AppState>) -> Json<ProjectsResponse> {
    Json(ProjectsResponse {
        projects: state.app.engine.projects().cloned().collect(),
    })
}

// ============ GET /projects/{id}/status ============

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectStatus>, AppError> {
    if state.app.engine.project(&id).is_none() {
        return Err(not_found(format!("project '{}' is not configured", id)));
    }
    project_status(&state.app, &id, false)
        .await
        .map(Json)
        .map_err(|e| internal(format!("{:#}", e)))
}

// ============ POST /sync ============

#[derive(Deserialize)]
struct SyncParams {
    project_id: Option<String>,
    #[serde(default = "default_incremental")]
    incremental: bool,
}

fn default_incremental() -> bool {
    true
}

/// Runs the sync on its own task so a client disconnect does not abort it
/// halfway through a batch.
async fn handle_sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
) -> Result<(StatusCode, Json<RunResult>), AppError> {
    let project_id = params
        .project_id
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("project_id is required"))?;

    let incremental = params.incremental;
    let app = Arc::clone(&state.app);
    let result = tokio::spawn(async move {
        let result = app.engine.run_sync(&project_id, incremental).await;
        if let Err(e) = history::record_run(&app.pool, &result).await {
            tracing::warn!("failed to record run history: {:#}", e);
        }
        result
    })
    .await
    .map_err(|e| internal(format!("sync task failed: {}", e)))?;

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}
