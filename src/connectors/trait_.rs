//! Connector trait definition
//!
//! Defines the interface every external system client implements: a health
//! probe and a paged fetch of raw records for one entity type.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::data_source::Model as DataSource;
use crate::normalization::EntityType;

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("HTTP error {status}: {}", .body.as_deref().unwrap_or("No body"))]
    HttpError { status: u16, body: Option<String> },

    #[error("Malformed response: {details}")]
    MalformedResponse { details: String },

    #[error("Network error: {details}")]
    NetworkError { details: String, retryable: bool },

    #[error("Authentication error: {details}")]
    AuthenticationError { details: String },

    #[error("Rate limit exceeded{}", .retry_after.map(|s| format!(" (retry after: {s}s)")).unwrap_or_default())]
    RateLimitError { retry_after: Option<u64> },

    #[error("Configuration error: {details}")]
    ConfigurationError { details: String },

    #[error("Unknown error: {details}")]
    Unknown { details: String },
}

impl ConnectorError {
    /// Whether a later attempt of the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            SyncError::from(self.clone()).kind,
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. }
        )
    }
}

/// Sync-specific classification of a connector failure, recorded on failed jobs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    Unauthorized,
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    Transient,
    Permanent,
}

impl SyncError {
    fn with_kind(kind: SyncErrorKind, message: Option<String>) -> Self {
        Self { kind, message }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Unauthorized, Some(message.into()))
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self::with_kind(SyncErrorKind::RateLimited { retry_after_secs }, None)
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Transient, Some(message.into()))
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Permanent, Some(message.into()))
    }
}

impl From<ConnectorError> for SyncError {
    fn from(connector_error: ConnectorError) -> Self {
        match connector_error {
            ConnectorError::RateLimitError { retry_after } => SyncError::rate_limited(retry_after),
            ConnectorError::AuthenticationError { details } => SyncError::unauthorized(details),
            ConnectorError::NetworkError { details, retryable } => {
                if retryable {
                    SyncError::transient(details)
                } else {
                    SyncError::permanent(details)
                }
            }
            ConnectorError::HttpError { status, body } => {
                let message = format!("HTTP error {}: {}", status, body.unwrap_or_default());
                if status == 429 {
                    SyncError::rate_limited(None)
                } else if (400..500).contains(&status) {
                    SyncError::permanent(message)
                } else {
                    SyncError::transient(message)
                }
            }
            ConnectorError::MalformedResponse { details } => {
                SyncError::permanent(format!("Malformed response: {details}"))
            }
            ConnectorError::ConfigurationError { details } => {
                SyncError::permanent(format!("Configuration error: {details}"))
            }
            ConnectorError::Unknown { details } => {
                SyncError::transient(format!("Unknown error: {details}"))
            }
        }
    }
}

/// Cursor for pagination in sync operations.
///
/// Wraps an opaque JSON payload returned by connectors. The payload may be a
/// primitive or structured object and must round-trip without alteration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub Value);

impl Cursor {
    pub fn from_json(value: Value) -> Self {
        Self(value)
    }

    pub fn from_string<S: Into<String>>(value: S) -> Self {
        Self(Value::String(value.into()))
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl From<Cursor> for Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

/// Parameters for one page fetch
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub data_source: DataSource,
    pub entity_type: EntityType,
    /// `None` requests the first page
    pub cursor: Option<Cursor>,
}

/// One page of raw records
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<Value>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Probe the external system with the data source's credentials.
    async fn check_health(&self, data_source: &DataSource) -> Result<bool, ConnectorError>;

    /// Fetch one page of raw records for `params.entity_type`.
    async fn fetch(&self, params: FetchParams) -> Result<FetchPage, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        let err = ConnectorError::HttpError {
            status: 503,
            body: None,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "HTTP error 503: No body");

        let err = ConnectorError::HttpError {
            status: 404,
            body: Some("gone".into()),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            SyncError::from(err).kind,
            SyncErrorKind::Permanent
        );

        let err = ConnectorError::HttpError {
            status: 429,
            body: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_display_includes_retry_hint() {
        let err = ConnectorError::RateLimitError {
            retry_after: Some(30),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded (retry after: 30s)");
    }

    #[test]
    fn sync_error_serializes_with_type_tag() {
        let value = serde_json::to_value(SyncError::rate_limited(Some(5))).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "rate_limited", "retry_after_secs": 5})
        );
    }
}
