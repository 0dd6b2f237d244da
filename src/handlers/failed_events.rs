//! # Failed Events API Handlers
//!
//! Events a stage gave up on after exhausting redelivery.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, validation_error};
use crate::handlers::jobs::parse_uuid;
use crate::models::failed_event;
use crate::repositories::{FailedEventFilter, FailedEventRepository};
use crate::server::AppState;

/// Query parameters for listing failed events
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListFailedEventsQuery {
    /// Filter by tenant (UUID)
    pub tenant_id: Option<String>,
    /// Filter by data source (UUID)
    pub data_source_id: Option<String>,
    /// Filter by sync run (UUID)
    pub sync_id: Option<String>,
    /// Maximum number of events to return (default: 50, max: 100)
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FailedEventInfo {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_id: String,
    #[schema(example = "licenses")]
    pub entity_type: String,
    #[schema(example = "processed")]
    pub stage: String,
    #[schema(example = "sweeper")]
    pub handler: String,
    pub topic: String,
    pub sync_id: Option<String>,
    pub batch_number: Option<i32>,
    pub error: String,
    pub attempts: i32,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FailedEventsResponse {
    pub failed_events: Vec<FailedEventInfo>,
}

impl From<failed_event::Model> for FailedEventInfo {
    fn from(model: failed_event::Model) -> Self {
        Self {
            id: model.id.to_string(),
            event_id: model.event_id.to_string(),
            tenant_id: model.tenant_id.to_string(),
            data_source_id: model.data_source_id.to_string(),
            integration_id: model.integration_id,
            entity_type: model.entity_type,
            stage: model.stage,
            handler: model.handler,
            topic: model.topic,
            sync_id: model.sync_id.map(|id| id.to_string()),
            batch_number: model.batch_number,
            error: model.error,
            attempts: model.attempts,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// List failed events, newest first
#[utoipa::path(
    get,
    path = "/failed-events",
    params(ListFailedEventsQuery),
    responses(
        (status = 200, description = "Failed events matching the filters", body = FailedEventsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "failed-events"
)]
pub async fn list_failed_events(
    State(state): State<AppState>,
    Query(params): Query<ListFailedEventsQuery>,
) -> Result<Json<FailedEventsResponse>, ApiError> {
    let limit = match params.limit {
        Some(limit) if limit == 0 || limit > 100 => {
            return Err(validation_error(
                "Invalid limit",
                json!({ "limit": "Must be between 1 and 100" }),
            ));
        }
        Some(limit) => limit,
        None => 50,
    };

    let filter = FailedEventFilter {
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
        sync_id: params
            .sync_id
            .as_deref()
            .map(|v| parse_uuid("sync_id", v))
            .transpose()?,
        limit: Some(u64::from(limit)),
    };

    let events = FailedEventRepository::new(state.db.clone())
        .list(filter)
        .await?;
    Ok(Json(FailedEventsResponse {
        failed_events: events.into_iter().map(FailedEventInfo::from).collect(),
    }))
}
