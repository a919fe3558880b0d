//! HTTP adapter over `JobService`.
//!
//! Caller identity comes from headers set by the authenticating proxy in
//! front of this service; nothing here validates credentials.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorKind, JobError};
use crate::jobs::{
    Caller, ErrorSummary, ExecutionPhase, JobCreate, JobFilter, JobParameter, JobResult,
    JobService, PageToken,
};

pub const SERVICE_HEADER: &str = "x-auth-request-service";
pub const USER_HEADER: &str = "x-auth-request-user";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<JobService>,
    /// Users granted the administrative override.
    pub admin_users: Arc<Vec<String>>,
}

/// Build the Axum router for the job API.
pub fn job_routes(service: Arc<JobService>, admin_users: Vec<String>) -> Router {
    let state = ApiState {
        service,
        admin_users: Arc::new(admin_users),
    };

    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/phase", post(update_phase))
        .route("/jobs/{id}/complete", post(complete_job))
        .route("/jobs/{id}/fail", post(fail_job))
        .route("/jobs/{id}/results", post(append_result))
        .route("/jobs/{id}/error", put(set_error))
        .route("/jobs/{id}/parameters", put(update_parameters))
        .route("/jobs/{id}/destruction", put(set_destruction_time))
        .route("/jobs/{id}/executionduration", put(set_execution_duration))
        .route("/jobs/{id}/quote", put(set_quote))
        .route("/admin/services", get(list_services))
        .route("/admin/services/{service}/users", get(list_users))
        .route("/admin/services/{service}/users/{user}/jobs", get(list_user_jobs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// A failed request, rendered as `{"error": kind, "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthenticated",
            message: message.into(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::IllegalTransition => StatusCode::CONFLICT,
        ErrorKind::Conflict => StatusCode::PRECONDITION_FAILED,
        ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let kind = err.kind();
        Self {
            status: status_for(kind),
            kind: kind.as_str(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.kind, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn caller(state: &ApiState, headers: &HeaderMap) -> ApiResult<Caller> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let service = header_value(SERVICE_HEADER)
        .ok_or_else(|| ApiError::unauthenticated("missing X-Auth-Request-Service header"))?;
    let user = header_value(USER_HEADER)
        .ok_or_else(|| ApiError::unauthenticated("missing X-Auth-Request-User header"))?;

    let admin = state.admin_users.iter().any(|admin| admin == user);
    Ok(Caller::new(service, user).with_admin(admin))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.service.availability().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "service": "uws-store"})),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "message": e.to_string()})),
        ),
    }
}

// ── Listing ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    /// Comma-separated phases.
    phase: Option<String>,
    created_after: Option<DateTime<Utc>>,
    destruction_before: Option<DateTime<Utc>>,
    destruction_after: Option<DateTime<Utc>>,
    #[serde(default)]
    include_expired: bool,
    limit: Option<usize>,
    page: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> Result<(JobFilter, Option<PageToken>), JobError> {
        let mut filter = JobFilter::new().include_expired(self.include_expired);
        if let Some(raw) = &self.phase {
            let phases = raw
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.parse::<ExecutionPhase>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(JobError::Validation)?;
            filter = filter.phases(phases);
        }
        filter.created_after = self.created_after;
        filter.destruction_before = self.destruction_before;
        filter.destruction_after = self.destruction_after;
        filter.limit = self.limit;

        let page = self.page.as_deref().map(PageToken::decode).transpose()?;
        Ok((filter, page))
    }
}

async fn list_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let (filter, page) = query.into_filter()?;
    let jobs = state.service.list_jobs(&caller, filter, page.as_ref()).await?;
    Ok(Json(jobs))
}

async fn list_services(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    Ok(Json(state.service.list_services(&caller).await?))
}

async fn list_users(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    Ok(Json(state.service.list_users(&caller, Some(&service)).await?))
}

async fn list_user_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((service, user)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let (filter, page) = query.into_filter()?;
    let jobs = state
        .service
        .list_user_jobs(&caller, &service, &user, filter, page.as_ref())
        .await?;
    Ok(Json(jobs))
}

// ── Single job ──────────────────────────────────────────────────────────

async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<JobCreate>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state.service.create_job(&caller, body).await?;
    let location = format!("/jobs/{}", job.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(job)))
}

#[derive(Debug, Default, Deserialize)]
struct GetQuery {
    #[serde(default)]
    include_expired: bool,
}

async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<GetQuery>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .get_job(&caller, id, query.include_expired)
        .await?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let existed = state.service.delete_job(&caller, id).await?;
    debug!(job_id = %id, existed, "Delete request handled");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PhaseRequest {
    phase: ExecutionPhase,
    #[serde(default)]
    expected: Option<ExecutionPhase>,
    /// When the change happened; defaults to now.
    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
    /// Queue message id, accepted only with `QUEUED`.
    #[serde(default)]
    message_id: Option<String>,
}

async fn update_phase(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<PhaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = match (body.phase, body.message_id) {
        (ExecutionPhase::Queued, message_id) => {
            state
                .service
                .queue_job(&caller, id, body.expected, message_id, body.occurred_at)
                .await?
        }
        (phase, Some(_)) => {
            return Err(JobError::Validation(format!(
                "message_id is only accepted with phase QUEUED, not {phase}"
            ))
            .into());
        }
        (phase, None) => {
            state
                .service
                .update_phase(&caller, id, body.expected, phase, body.occurred_at)
                .await?
        }
    };
    Ok(Json(job))
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    results: Vec<JobResult>,
    #[serde(default)]
    expected: Option<ExecutionPhase>,
}

async fn complete_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .complete_job(&caller, id, body.expected, body.results)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct FailRequest {
    error: ErrorSummary,
    #[serde(default)]
    expected: Option<ExecutionPhase>,
}

async fn fail_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .fail_job(&caller, id, body.expected, body.error)
        .await?;
    Ok(Json(job))
}

async fn append_result(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<JobResult>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    Ok(Json(state.service.append_result(&caller, id, body).await?))
}

async fn set_error(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ErrorSummary>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    Ok(Json(state.service.set_error(&caller, id, body).await?))
}

#[derive(Deserialize)]
struct ParametersRequest {
    parameters: Vec<JobParameter>,
}

async fn update_parameters(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ParametersRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .update_parameters(&caller, id, body.parameters)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct DestructionRequest {
    /// `null` means the job never expires.
    destruction_time: Option<DateTime<Utc>>,
}

async fn set_destruction_time(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<DestructionRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .set_destruction_time(&caller, id, body.destruction_time)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct ExecutionDurationRequest {
    /// Seconds; `null` removes the quota.
    execution_duration: Option<u64>,
}

async fn set_execution_duration(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecutionDurationRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    let job = state
        .service
        .set_execution_duration(&caller, id, body.execution_duration)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct QuoteRequest {
    /// `null` clears the estimate.
    quote: Option<DateTime<Utc>>,
}

async fn set_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<QuoteRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller(&state, &headers)?;
    Ok(Json(state.service.set_quote(&caller, id, body.quote).await?))
}
