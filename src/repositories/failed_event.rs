//! # FailedEvent Repository
//!
//! Persists dead-lettered bus events so failures in the processor, sweeper,
//! linker and analyzer stages survive restarts and can be queried next to
//! the jobs that produced them.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{DeadLetter, DeadLetterSink};
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::failed_event::{self, ActiveModel, Column, Entity as FailedEvent};

/// Filters for listing failed events.
#[derive(Debug, Clone, Default)]
pub struct FailedEventFilter {
    pub tenant_id: Option<Uuid>,
    pub data_source_id: Option<Uuid>,
    pub sync_id: Option<Uuid>,
    pub limit: Option<u64>,
}

#[derive(Clone)]
pub struct FailedEventRepository {
    db: DatabaseConnection,
}

impl FailedEventRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, letter: &DeadLetter) -> Result<failed_event::Model, PipelineError> {
        let event = &letter.event;
        let metadata = event.sync_metadata.as_ref();
        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            event_id: Set(event.event_id),
            tenant_id: Set(event.tenant_id),
            data_source_id: Set(event.data_source_id),
            integration_id: Set(event.integration_id.clone()),
            entity_type: Set(event.entity_type.clone()),
            stage: Set(event.stage.as_str().to_string()),
            handler: Set(letter.handler.to_string()),
            topic: Set(letter.topic.clone()),
            sync_id: Set(metadata.map(|m| m.sync_id)),
            batch_number: Set(metadata.map(|m| m.batch_number)),
            event: Set(serde_json::to_value(event)?),
            error: Set(letter.error.clone()),
            attempts: Set(i32::try_from(letter.attempts).unwrap_or(i32::MAX)),
            created_at: Set(to_db_time(letter.failed_at)),
        };
        Ok(model.insert(&self.db).await?)
    }

    /// Failed events, newest first.
    pub async fn list(&self, filter: FailedEventFilter) -> Result<Vec<failed_event::Model>, DbErr> {
        let mut query = FailedEvent::find().order_by_desc(Column::CreatedAt);
        if let Some(tenant_id) = filter.tenant_id {
            query = query.filter(Column::TenantId.eq(tenant_id));
        }
        if let Some(data_source_id) = filter.data_source_id {
            query = query.filter(Column::DataSourceId.eq(data_source_id));
        }
        if let Some(sync_id) = filter.sync_id {
            query = query.filter(Column::SyncId.eq(sync_id));
        }
        query
            .limit(filter.limit.unwrap_or(100).min(500))
            .all(&self.db)
            .await
    }
}

#[async_trait]
impl DeadLetterSink for FailedEventRepository {
    async fn record(&self, letter: &DeadLetter) -> Result<(), PipelineError> {
        let model = self.insert(letter).await?;
        warn!(
            failed_event_id = %model.id,
            handler = %model.handler,
            topic = %model.topic,
            sync_id = ?model.sync_id,
            batch_number = ?model.batch_number,
            "Dead letter recorded"
        );
        Ok(())
    }
}
