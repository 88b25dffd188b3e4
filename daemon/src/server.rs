use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{AddJobRequest, ErrorBody, JobChanges, ScheduledJob, SchedulerStatus, Trigger};
use std::sync::Arc;

use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<dyn Scheduler>,
    pub metrics: Arc<MetricsCollector>,
    /// No key means every caller is accepted.
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(scheduler: Arc<dyn Scheduler>, metrics: Arc<MetricsCollector>, api_key: Option<String>) -> Self {
        Self { scheduler, metrics, api_key: api_key.map(Arc::from) }
    }
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::AlreadyRunning { .. } | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::InvalidTrigger(_) | EngineError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            EngineError::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, EngineError>;

/// Scheduler wire protocol plus unauthenticated health and metrics.
pub fn router(state: AppState) -> Router {
    let scheduler = Router::new()
        .route("/scheduler/jobs", post(add_job).get(get_jobs))
        .route("/scheduler/jobs/{id}", get(get_job).patch(modify_job).delete(remove_job))
        .route("/scheduler/jobs/{id}/reschedule", post(reschedule_job))
        .route("/scheduler/jobs/{id}/pause", post(pause_job))
        .route("/scheduler/jobs/{id}/resume", post(resume_job))
        .route("/scheduler/pause", post(pause))
        .route("/scheduler/resume", post(resume))
        .route("/scheduler/status", get(status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(scheduler)
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(req).await;
    };
    let provided = req
        .headers()
        .get(common::API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected.as_ref() {
        return next.run(req).await;
    }
    log::warn!("Rejected {} {}: invalid API key", req.method(), req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody { error: "invalid or missing API key".to_string() }),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
}

async fn add_job(
    State(state): State<AppState>,
    Json(req): Json<AddJobRequest>,
) -> Result<(StatusCode, Json<ScheduledJob>), EngineError> {
    let job = state.scheduler.add_job(&req.id, req.trigger, req.args).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_jobs(State(state): State<AppState>) -> ApiResult<Vec<ScheduledJob>> {
    Ok(Json(state.scheduler.get_jobs().await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ScheduledJob> {
    state
        .scheduler
        .get_job(&id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::not_found("Scheduled job", id))
}

async fn modify_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<JobChanges>,
) -> ApiResult<ScheduledJob> {
    Ok(Json(state.scheduler.modify_job(&id, changes).await?))
}

async fn reschedule_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(trigger): Json<Trigger>,
) -> ApiResult<ScheduledJob> {
    Ok(Json(state.scheduler.reschedule_job(&id, trigger).await?))
}

async fn remove_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    state.scheduler.remove_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ScheduledJob> {
    Ok(Json(state.scheduler.pause_job(&id).await?))
}

async fn resume_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ScheduledJob> {
    Ok(Json(state.scheduler.resume_job(&id).await?))
}

async fn pause(State(state): State<AppState>) -> ApiResult<SchedulerStatus> {
    state.scheduler.pause().await?;
    Ok(Json(state.scheduler.status().await?))
}

async fn resume(State(state): State<AppState>) -> ApiResult<SchedulerStatus> {
    state.scheduler.resume().await?;
    Ok(Json(state.scheduler.status().await?))
}

async fn status(State(state): State<AppState>) -> ApiResult<SchedulerStatus> {
    Ok(Json(state.scheduler.status().await?))
}
