//! # Error Handling
//!
//! Two error surfaces live here. [`PipelineError`] is what every pipeline
//! stage returns; its [`ErrorKind`] decides whether the job store schedules a
//! retry. [`ApiError`] is the problem+json shape served by the HTTP surface.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::bus::BusError;
use crate::connectors::{ConnectorError, RegistryError, SyncError};
use crate::telemetry;

/// Failure taxonomy used by the job store's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// External or infrastructure failure; retried with backoff until
    /// `attempts_max` is reached.
    Transient,
    /// The request itself is wrong (unsupported entity type, bad payload).
    /// Retrying cannot help.
    Validation,
    /// The target is gone or refuses us (missing data source, revoked
    /// credentials).
    Permanent,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Permanent => "permanent",
        }
    }
}

/// Error returned by scheduler, adapter, processor, linker and analyzer stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity type '{entity_type}' is not supported by integration '{integration_type}'")]
    UnsupportedEntityType {
        integration_type: String,
        entity_type: String,
    },

    #[error("malformed job action '{0}', expected sync.<entityType>")]
    MalformedAction(String),

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("data source {0} not found")]
    DataSourceNotFound(Uuid),

    #[error("data source {0} is inactive")]
    DataSourceInactive(Uuid),

    #[error("data source {0} failed its health check")]
    Unhealthy(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job {0} exceeded its running lease")]
    LeaseExpired(Uuid),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Database(_)
            | PipelineError::Bus(_)
            | PipelineError::Unhealthy(_)
            | PipelineError::LeaseExpired(_) => ErrorKind::Transient,
            PipelineError::Connector(err) if err.is_retryable() => ErrorKind::Transient,
            PipelineError::Connector(ConnectorError::MalformedResponse { .. }) => {
                ErrorKind::Validation
            }
            PipelineError::Connector(_) => ErrorKind::Permanent,
            PipelineError::Registry(_)
            | PipelineError::Serialization(_)
            | PipelineError::UnsupportedEntityType { .. }
            | PipelineError::MalformedAction(_)
            | PipelineError::InvalidPayload(_)
            | PipelineError::DataSourceNotFound(_) => ErrorKind::Validation,
            PipelineError::DataSourceInactive(_) | PipelineError::JobNotFound(_) => {
                ErrorKind::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable machine-readable code recorded on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Database(_) => "DATABASE_ERROR",
            PipelineError::Connector(_) => "CONNECTOR_ERROR",
            PipelineError::Bus(_) => "BUS_ERROR",
            PipelineError::Registry(_) => "NOT_REGISTERED",
            PipelineError::Serialization(_) => "SERIALIZATION_ERROR",
            PipelineError::UnsupportedEntityType { .. } => "UNSUPPORTED_ENTITY_TYPE",
            PipelineError::MalformedAction(_) => "MALFORMED_ACTION",
            PipelineError::InvalidPayload(_) => "INVALID_PAYLOAD",
            PipelineError::DataSourceNotFound(_) => "DATA_SOURCE_NOT_FOUND",
            PipelineError::DataSourceInactive(_) => "DATA_SOURCE_INACTIVE",
            PipelineError::Unhealthy(_) => "UNHEALTHY",
            PipelineError::JobNotFound(_) => "JOB_NOT_FOUND",
            PipelineError::LeaseExpired(_) => "LEASE_EXPIRED",
        }
    }

    /// Connector-level classification, when the failure came from a connector.
    pub fn sync_error(&self) -> Option<SyncError> {
        match self {
            PipelineError::Connector(err) => Some(SyncError::from(err.clone())),
            _ => None,
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Active trace id, or a short generated correlation id when no context is set.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().simple().to_string()[..8]).into_boxed_str()))
    }
}

/// Detects unique-constraint violations across Postgres and SQLite.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| code.as_ref() == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
        .unwrap_or(false)
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Not Found")]
    NotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::Conflict => "CONFLICT",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            &error_type.to_string(),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Database(db) => db.into(),
            PipelineError::JobNotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Job {id} not found"),
            ),
            PipelineError::DataSourceNotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Data source {id} not found"),
            ),
            other if other.kind() == ErrorKind::Validation => {
                validation_error(&other.to_string(), json!({ "code": other.code() }))
            }
            other => {
                tracing::error!(error = %other, "Pipeline error surfaced to API");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_failures_map_to_retry_kinds() {
        let network = PipelineError::Connector(ConnectorError::NetworkError {
            details: "timeout".into(),
            retryable: true,
        });
        assert_eq!(network.kind(), ErrorKind::Transient);
        assert!(network.is_retryable());

        let auth = PipelineError::Connector(ConnectorError::AuthenticationError {
            details: "revoked".into(),
        });
        assert_eq!(auth.kind(), ErrorKind::Permanent);

        let malformed = PipelineError::Connector(ConnectorError::MalformedResponse {
            details: "not json".into(),
        });
        assert_eq!(malformed.kind(), ErrorKind::Validation);
    }

    #[test]
    fn request_shape_errors_are_validation() {
        let err = PipelineError::UnsupportedEntityType {
            integration_type: "acme".into(),
            entity_type: "printers".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), "UNSUPPORTED_ENTITY_TYPE");
        assert!(!err.is_retryable());
        assert_eq!(
            PipelineError::DataSourceNotFound(Uuid::nil()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn api_error_sets_problem_json_and_retry_after() {
        let response = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Rate limit exceeded",
        )
        .with_retry_after(60)
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn trace_id_falls_back_to_correlation_id() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "bad");
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn pipeline_not_found_maps_to_404() {
        let api: ApiError = PipelineError::JobNotFound(Uuid::nil()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);

        let api: ApiError = PipelineError::MalformedAction("sync".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.details.unwrap()["code"], "MALFORMED_ACTION");
    }

    #[test]
    fn record_not_found_db_error_maps_to_404() {
        let api: ApiError = sea_orm::DbErr::RecordNotFound("job".to_string()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert!(api.message.contains("job"));
    }
}
