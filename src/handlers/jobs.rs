//! # Jobs API Handlers
//!
//! Read-only view of the job store: status, attempts and the structured
//! error of the last failure.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, PipelineError, validation_error};
use crate::models::scheduled_job::{self, ALL_JOB_STATUSES, JobStatus};
use crate::repositories::{JobFilter, ScheduledJobRepository};
use crate::server::AppState;

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// Filter by status (pending, running, completed, failed, invalid)
    pub status: Option<String>,
    /// Filter by tenant (UUID)
    pub tenant_id: Option<String>,
    /// Filter by data source (UUID)
    pub data_source_id: Option<String>,
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u32>,
}

/// Job information response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
    pub tenant_id: String,
    #[schema(example = "acme-rmm-1")]
    pub integration_id: String,
    pub data_source_id: String,
    #[schema(example = "sync.identities")]
    pub action: String,
    #[schema(example = "failed")]
    pub status: String,
    pub priority: i16,
    #[schema(example = 2)]
    pub attempts: i32,
    #[schema(example = 5)]
    pub attempts_max: i32,
    /// Pagination state carried between batch jobs
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Structured error of the last failure
    #[schema(value_type = Option<Object>)]
    pub error: Option<serde_json::Value>,
    pub scheduled_at: String,
    pub next_retry_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Response payload for jobs listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
}

impl From<scheduled_job::Model> for JobInfo {
    fn from(model: scheduled_job::Model) -> Self {
        Self {
            id: model.id.to_string(),
            tenant_id: model.tenant_id.to_string(),
            integration_id: model.integration_id,
            data_source_id: model.data_source_id.to_string(),
            action: model.action,
            status: model.status,
            priority: model.priority,
            attempts: model.attempts,
            attempts_max: model.attempts_max,
            payload: model.payload,
            error: model.error,
            scheduled_at: model.scheduled_at.to_rfc3339(),
            next_retry_at: model.next_retry_at.map(|dt| dt.to_rfc3339()),
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            finished_at: model.finished_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value)
        .map_err(|_| validation_error(&format!("Invalid {field}"), json!({ field: "Must be a valid UUID" })))
}

/// List jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs matching the filters", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = match params.limit {
        Some(0) => {
            return Err(validation_error(
                "Invalid limit",
                json!({ "limit": "Minimum allowed limit is 1" }),
            ));
        }
        Some(limit) if limit > 100 => {
            return Err(validation_error(
                "Invalid limit",
                json!({ "limit": "Maximum allowed limit is 100" }),
            ));
        }
        Some(limit) => limit,
        None => 50,
    };

    let status = match params.status.as_deref() {
        Some(value) => Some(JobStatus::parse(value).ok_or_else(|| {
            let allowed: Vec<&str> = ALL_JOB_STATUSES.iter().map(|s| s.as_str()).collect();
            validation_error(
                "Invalid status",
                json!({ "status": format!("Must be one of: {}", allowed.join(", ")) }),
            )
        })?),
        None => None,
    };

    let filter = JobFilter {
        tenant_id: params
            .tenant_id
            .as_deref()
            .map(|v| parse_uuid("tenant_id", v))
            .transpose()?,
        data_source_id: params
            .data_source_id
            .as_deref()
            .map(|v| parse_uuid("data_source_id", v))
            .transpose()?,
        status,
        limit: Some(u64::from(limit)),
    };

    let repo = ScheduledJobRepository::new(state.db.clone(), state.config.scheduler.clone());
    let jobs = repo.list(filter).await?;

    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobInfo::from).collect(),
    }))
}

/// Fetch one job by id
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = String, Path, description = "Job id (UUID)")),
    responses(
        (status = 200, description = "The job", body = JobInfo),
        (status = 400, description = "Malformed id", body = ApiError),
        (status = 404, description = "No such job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    let id = parse_uuid("id", &id)?;
    let repo = ScheduledJobRepository::new(state.db.clone(), state.config.scheduler.clone());
    let job = repo
        .find(id)
        .await?
        .ok_or(PipelineError::JobNotFound(id))?;
    Ok(Json(JobInfo::from(job)))
}
