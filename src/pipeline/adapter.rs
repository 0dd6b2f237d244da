//! Adapter stage
//!
//! Turns one claimed `sync.<entityType>` job into one fetched page. The
//! [`AdapterDriver`] owns the pagination skeleton (run identity, health
//! probe, cursor chaining, job transitions); an [`Adapter`] only knows how to
//! fetch a page from its integration.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{EventEnvelope, EventHandler, FetchedPayload, Stage, SyncMetadata, SyncRequest};
use crate::connectors::{
    Connector, ConnectorError, Cursor, FetchPage, FetchParams, IntegrationMetadata,
};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::models::data_source;
use crate::models::scheduled_job::{self, JobStatus};
use crate::normalization::{EntityType, parse_entity_type, parse_sync_action};
use crate::repositories::JobPayload;

/// Per-integration page source.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn integration_type(&self) -> &str;

    fn supported_entity_types(&self) -> &[EntityType];

    async fn check_health(&self, _data_source: &data_source::Model) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    /// Fetch the page at `cursor` (`None` for the first page).
    async fn fetch_page(
        &self,
        data_source: &data_source::Model,
        entity_type: EntityType,
        cursor: Option<Cursor>,
    ) -> Result<FetchPage, ConnectorError>;
}

/// Adapter over any [`Connector`]: pages are passed through unchanged.
pub struct ConnectorAdapter {
    metadata: IntegrationMetadata,
    connector: Arc<dyn Connector>,
}

impl ConnectorAdapter {
    pub fn new(metadata: IntegrationMetadata, connector: Arc<dyn Connector>) -> Self {
        Self {
            metadata,
            connector,
        }
    }
}

#[async_trait]
impl Adapter for ConnectorAdapter {
    fn integration_type(&self) -> &str {
        &self.metadata.integration_type
    }

    fn supported_entity_types(&self) -> &[EntityType] {
        &self.metadata.entity_types
    }

    async fn check_health(&self, data_source: &data_source::Model) -> Result<bool, ConnectorError> {
        self.connector.check_health(data_source).await
    }

    async fn fetch_page(
        &self,
        data_source: &data_source::Model,
        entity_type: EntityType,
        cursor: Option<Cursor>,
    ) -> Result<FetchPage, ConnectorError> {
        self.connector
            .fetch(FetchParams {
                data_source: data_source.clone(),
                entity_type,
                cursor,
            })
            .await
    }
}

/// Identity of the run a job belongs to.
#[derive(Debug, Clone, Copy)]
struct RunPosition {
    sync_id: Uuid,
    batch_number: i32,
    total_processed: u64,
    sync_started_at: DateTime<Utc>,
}

/// Consumes `*.sync.*` events.
pub struct AdapterDriver {
    ctx: PipelineContext,
}

impl AdapterDriver {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(job_id = %job.id, action = %job.action))]
    async fn run_job(&self, job: &scheduled_job::Model) -> Result<(), PipelineError> {
        let data_source = self
            .ctx
            .data_sources
            .find(job.data_source_id)
            .await?
            .ok_or(PipelineError::DataSourceNotFound(job.data_source_id))?;
        if !data_source.is_active() {
            return Err(PipelineError::DataSourceInactive(data_source.id));
        }

        let segment = parse_sync_action(&job.action)
            .ok_or_else(|| PipelineError::MalformedAction(job.action.clone()))?;
        let adapter = self.ctx.registry.adapter(&data_source.integration_type)?;
        let entity_type = parse_entity_type(segment)
            .filter(|t| adapter.supported_entity_types().contains(t))
            .ok_or_else(|| PipelineError::UnsupportedEntityType {
                integration_type: data_source.integration_type.clone(),
                entity_type: segment.to_string(),
            })?;

        let mut payload = JobPayload::from_json(&job.payload)?;
        let position = match payload.sync_id {
            Some(sync_id) => RunPosition {
                sync_id,
                batch_number: payload.batch_number.unwrap_or(1),
                total_processed: payload.total_processed.unwrap_or(0),
                sync_started_at: payload
                    .sync_started_at
                    .unwrap_or_else(|| job.created_at.with_timezone(&Utc)),
            },
            None => {
                let position = RunPosition {
                    sync_id: Uuid::new_v4(),
                    batch_number: 1,
                    total_processed: 0,
                    sync_started_at: Utc::now(),
                };
                payload.sync_id = Some(position.sync_id);
                payload.batch_number = Some(1);
                payload.total_processed = Some(0);
                payload.sync_started_at = Some(position.sync_started_at);
                self.ctx.jobs.record_sync_start(job, &payload).await?;
                info!(sync_id = %position.sync_id, "Sync run started");
                position
            }
        };

        if position.batch_number == 1 {
            if !adapter.check_health(&data_source).await? {
                return Err(PipelineError::Unhealthy(data_source.id));
            }
            self.ctx
                .data_sources
                .set_current_sync(data_source.id, position.sync_id)
                .await?;
        }

        let started = Instant::now();
        let page = adapter
            .fetch_page(&data_source, entity_type, payload.cursor.clone())
            .await?;
        histogram!("pipeline_adapter_fetch_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        let record_count = page.records.len();
        let total_processed = position.total_processed + record_count as u64;
        let next_cursor = match (page.has_more, page.next_cursor) {
            (true, Some(cursor)) => Some(cursor),
            (true, None) => {
                warn!(
                    sync_id = %position.sync_id,
                    batch_number = position.batch_number,
                    "Connector reported more pages without a cursor; ending run"
                );
                None
            }
            (false, _) => None,
        };
        let is_final_batch = next_cursor.is_none();

        let fetched = FetchedPayload {
            records: page.records,
            has_more: !is_final_batch,
            total_processed,
        };
        let event = EventEnvelope::new(
            &data_source,
            entity_type.as_str(),
            Stage::Fetched,
            json!(fetched),
        )
        .with_sync_metadata(SyncMetadata {
            sync_id: position.sync_id,
            batch_number: position.batch_number,
            is_final_batch,
            cursor: next_cursor.clone(),
            sync_started_at: position.sync_started_at,
            total_processed,
        });
        self.ctx.bus.publish(&event.topic(), event).await?;

        counter!("pipeline_adapter_records_fetched_total", "entity_type" => entity_type.as_str())
            .increment(record_count as u64);

        match next_cursor {
            Some(cursor) => {
                let next = JobPayload {
                    cursor: Some(cursor),
                    sync_id: Some(position.sync_id),
                    batch_number: Some(position.batch_number + 1),
                    total_processed: Some(total_processed),
                    sync_started_at: Some(position.sync_started_at),
                };
                let next_job = self.ctx.jobs.advance_batch(job, &data_source, &next).await?;
                debug!(
                    sync_id = %position.sync_id,
                    batch_number = position.batch_number,
                    next_job_id = %next_job.id,
                    records = record_count,
                    "Batch fetched; next page queued"
                );
            }
            None => {
                self.ctx.jobs.complete_job(job).await?;
                self.ctx
                    .data_sources
                    .clear_current_sync(data_source.id, position.sync_id)
                    .await?;
                info!(
                    sync_id = %position.sync_id,
                    batches = position.batch_number,
                    total_processed,
                    "Sync run fetched completely"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AdapterDriver {
    fn name(&self) -> &'static str {
        "adapter"
    }

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError> {
        let request: SyncRequest = event.decode_payload()?;

        let Some(job) = self.ctx.jobs.find(request.job_id).await? else {
            warn!(job_id = %request.job_id, "Sync event for unknown job; ignoring");
            return Ok(());
        };
        if job.job_status() != Some(JobStatus::Running) {
            debug!(job_id = %job.id, status = %job.status, "Job not running; ignoring redelivered sync event");
            return Ok(());
        }

        if let Err(err) = self.run_job(&job).await {
            warn!(job_id = %job.id, error = %err, kind = err.kind().as_str(), "Sync job failed");
            // Batch 1 may have written the run identity into the payload.
            let job = self.ctx.jobs.find(job.id).await?.unwrap_or(job);
            self.ctx.jobs.fail_job(&job, &err).await?;
        }
        Ok(())
    }
}
