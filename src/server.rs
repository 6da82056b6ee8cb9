//! HTTP API over the orchestrator.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/runs` | List runs |
//! | `POST` | `/runs` | Start a run from an `ExcuseRequest` body |
//! | `GET`  | `/runs/{id}` | Current run snapshot |
//! | `POST` | `/runs/{id}/select` | `{"candidate_id": "..."}` |
//! | `POST` | `/runs/{id}/review` | `{"decision": "approve" \| "reject"}` or `{"decision": "redraft", "notes": "..."}` |
//! | `POST` | `/runs/{id}/cancel` | Cancel a run |
//! | `POST` | `/memory/similar` | `{"text": "...", "k": 5, "category": "excuse"}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "run_not_found", "message": "run not found: 42" } }
//! ```
//!
//! The code is the snake-case [`ErrorKind`]. Client mistakes map to 4xx,
//! unavailable capabilities and stores to 503, everything else to 500.
//!
//! When `[cache] purge_interval_secs` is non-zero a background task purges
//! expired cache entries on that interval.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use excuse_harness_core::memory::MemoryHit;
use excuse_harness_core::models::{ArtifactCategory, ExcuseRequest};
use excuse_harness_core::{ErrorKind, PipelineError};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::run::{ReviewDecision, RunSnapshot};
use crate::stores::build_orchestrator;

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    similar_limit: usize,
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let (orchestrator, stores) = build_orchestrator(config).await?;

    if config.cache.purge_interval_secs > 0 {
        spawn_purge_task(
            orchestrator.clone(),
            Duration::from_secs(config.cache.purge_interval_secs),
        );
    }

    let app = router(orchestrator, config.memory.similar_limit);
    let bind_addr = config.server.bind.clone();
    println!("Excuse harness listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    stores.close().await;
    Ok(())
}

/// Build the router. Exposed for in-process tests.
pub fn router(orchestrator: Orchestrator, similar_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/runs", get(handle_list_runs).post(handle_start_run))
        .route("/runs/{id}", get(handle_get_run))
        .route("/runs/{id}/select", post(handle_select))
        .route("/runs/{id}/review", post(handle_review))
        .route("/runs/{id}/cancel", post(handle_cancel))
        .route("/memory/similar", post(handle_similar))
        .layer(cors)
        .with_state(AppState {
            orchestrator,
            similar_limit,
        })
}

fn spawn_purge_task(orchestrator: Orchestrator, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = orchestrator.cache().purge_expired().await {
                tracing::warn!(error = %e, "cache purge failed");
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

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

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let kind = err.root_kind();
        let status = match kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::RunNotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::CacheUnavailable
            | ErrorKind::MemoryUnavailable
            | ErrorKind::CapabilityUnavailable
            | ErrorKind::CapabilityDisabled
            | ErrorKind::EvidenceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StageTimeout | ErrorKind::SourceTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: kind.as_str().to_string(),
            message: err.to_string(),
        }
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

// ============ /runs ============

#[derive(Serialize)]
struct StartRunResponse {
    run_id: String,
}

async fn handle_start_run(
    State(state): State<AppState>,
    Json(request): Json<ExcuseRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    let run_id = state.orchestrator.start_run(request)?;
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Serialize)]
struct RunListResponse {
    runs: Vec<RunSnapshot>,
}

async fn handle_list_runs(State(state): State<AppState>) -> Json<RunListResponse> {
    Json(RunListResponse {
        runs: state.orchestrator.list_runs(),
    })
}

async fn handle_get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    Ok(Json(state.orchestrator.get_run_state(&id)?))
}

#[derive(Deserialize)]
struct SelectRequest {
    candidate_id: String,
}

async fn handle_select(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SelectRequest>,
) -> Result<Json<RunSnapshot>, AppError> {
    state.orchestrator.select_candidate(&id, &body.candidate_id)?;
    Ok(Json(state.orchestrator.get_run_state(&id)?))
}

async fn handle_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<RunSnapshot>, AppError> {
    state.orchestrator.submit_review(&id, decision)?;
    Ok(Json(state.orchestrator.get_run_state(&id)?))
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    state.orchestrator.cancel_run(&id)?;
    Ok(Json(state.orchestrator.get_run_state(&id)?))
}

// ============ POST /memory/similar ============

#[derive(Deserialize)]
struct SimilarRequest {
    text: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    category: Option<ArtifactCategory>,
}

#[derive(Serialize)]
struct SimilarResponse {
    hits: Vec<MemoryHit>,
}

async fn handle_similar(
    State(state): State<AppState>,
    Json(body): Json<SimilarRequest>,
) -> Result<Json<SimilarResponse>, AppError> {
    let k = body.k.unwrap_or(state.similar_limit);
    let hits = state
        .orchestrator
        .find_similar(&body.text, k, body.category)
        .await?;
    Ok(Json(SimilarResponse { hits }))
}
