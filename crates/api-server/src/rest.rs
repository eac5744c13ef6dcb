//! REST handlers for triggering materializations and reading segments.
//!
//! Every response uses the envelope `{"status": "success", "data": ...}` or
//! `{"status": "error", "message": ...}`.

use std::sync::Arc;
use std::time::Instant;

use audience_core::{AudienceError, RuleId, TriggerKind};
use audience_scheduler::{JobScheduler, JobState, MaterializationJob};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Largest sample a caller may request.
const MAX_SAMPLE: usize = 1000;
const DEFAULT_SAMPLE: usize = 10;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    pub data: T,
}

fn success<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "success",
        data,
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<AudienceError> for ApiError {
    fn from(e: AudienceError) -> Self {
        let status = match &e {
            AudienceError::Validation(_) | AudienceError::Cycle { .. } => StatusCode::BAD_REQUEST,
            AudienceError::RuleNotFound(_) | AudienceError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AudienceError::SchedulerBusy { .. } | AudienceError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            AudienceError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %e, "Request failed");
            metrics::counter!("api.errors").increment(1);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                status: "error",
                message: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub job_id: Uuid,
    pub rule_id: RuleId,
    pub state: JobState,
}

/// POST /v1/rules/:id/trigger: enqueue a manual materialization.
/// Repeated calls while the rule is in flight return the same job.
pub async fn trigger_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<RuleId>,
) -> Result<(StatusCode, Json<Envelope<TriggerResponse>>), ApiError> {
    let job_id = state.scheduler.enqueue(rule_id, TriggerKind::Manual).await?;
    let job = state.scheduler.get_job(job_id)?;
    metrics::counter!("api.triggers").increment(1);
    info!(rule_id, job_id = %job_id, "Manual trigger accepted");
    Ok((
        StatusCode::ACCEPTED,
        success(TriggerResponse {
            job_id,
            rule_id,
            state: job.state,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct RuleJobs {
    pub rule_id: RuleId,
    pub in_flight: Option<Uuid>,
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub jobs: Vec<MaterializationJob>,
}

/// GET /v1/rules/:id/jobs: job history of a rule, newest first.
pub async fn rule_jobs(
    State(state): State<AppState>,
    Path(rule_id): Path<RuleId>,
) -> ApiResult<RuleJobs> {
    state.scheduler.segmentation().get_rule(rule_id)?;
    Ok(success(RuleJobs {
        rule_id,
        in_flight: state.scheduler.in_flight_job(rule_id),
        next_run_at: state.scheduler.next_run_at(rule_id),
        jobs: state.scheduler.jobs_for_rule(rule_id),
    }))
}

/// GET /v1/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<MaterializationJob> {
    Ok(success(state.scheduler.get_job(job_id)?))
}

/// DELETE /v1/jobs/:id: cancel a job that has not started.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<MaterializationJob> {
    Ok(success(state.scheduler.cancel(job_id).await?))
}

/// GET /v1/segments
pub async fn list_segments(
    State(state): State<AppState>,
) -> ApiResult<Vec<audience_materializer::SegmentCatalogEntry>> {
    let entries = state.scheduler.writer().warehouse().list_catalog().await?;
    Ok(success(entries))
}

/// GET /v1/segments/:rule_id
pub async fn get_segment(
    State(state): State<AppState>,
    Path(rule_id): Path<RuleId>,
) -> ApiResult<audience_materializer::SegmentCatalogEntry> {
    state
        .scheduler
        .writer()
        .catalog_entry(rule_id)
        .await?
        .map(success)
        .ok_or_else(|| ApiError::not_found(format!("segment for rule {rule_id} is not published")))
}

#[derive(Debug, Deserialize)]
pub struct SampleParams {
    pub limit: Option<usize>,
}

/// GET /v1/segments/:rule_id/sample?limit=n
pub async fn sample_segment(
    State(state): State<AppState>,
    Path(rule_id): Path<RuleId>,
    Query(params): Query<SampleParams>,
) -> ApiResult<Vec<audience_core::SegmentRow>> {
    let writer = state.scheduler.writer();
    if !writer.is_published(rule_id).await? {
        return Err(ApiError::not_found(format!(
            "segment for rule {rule_id} is not published"
        )));
    }
    let limit = params.limit.unwrap_or(DEFAULT_SAMPLE).min(MAX_SAMPLE);
    Ok(success(writer.warehouse().sample(rule_id, limit).await?))
}

/// GET /v1/plan: materialization order and per-rule queries.
pub async fn get_plan(
    State(state): State<AppState>,
) -> ApiResult<audience_segmentation::MaterializationPlan> {
    Ok(success(state.scheduler.segmentation().plan()?))
}

/// POST /v1/conditions/normalize: canonical form of a raw condition tree.
pub async fn normalize_condition(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<audience_segmentation::NormalizedCondition> {
    Ok(success(state.scheduler.segmentation().normalize_preview(&raw)?))
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        jobs_in_flight: state.scheduler.in_flight_count(),
        warehouse: state.scheduler.writer().warehouse().backend(),
    })
}

/// GET /ready: ready once the dependency graph is consistent.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.scheduler.segmentation().graph_is_acyclic() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live: Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub jobs_in_flight: usize,
    pub warehouse: &'static str,
}
