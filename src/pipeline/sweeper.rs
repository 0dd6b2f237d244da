//! Sweeper stage
//!
//! Records every processed batch of a run in `sync_batches`. Once the final
//! batch is recorded and every batch before it is too, entities of the same
//! data source and entity type that the run never saw are soft-deleted.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use tracing::{debug, info, instrument};

use crate::bus::{EventEnvelope, EventHandler, ProcessedPayload, SyncMetadata};
use crate::context::PipelineContext;
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::entity::{Column as EntityColumn, Entity as EntityRecord};
use crate::models::sync_batch::{self, Column, Entity as SyncBatch};

/// What one processed event did to the run ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Batch recorded; the run is not complete yet
    Pending,
    /// Run complete; this many entities were soft-deleted
    Swept(u64),
}

/// Consumes `*.processed.*` events.
pub struct SweeperDriver {
    ctx: PipelineContext,
}

impl SweeperDriver {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(data_source_id = %event.data_source_id, entity_type = %event.entity_type))]
    pub async fn sweep(&self, event: &EventEnvelope) -> Result<SweepOutcome, PipelineError> {
        let sync = event.require_sync_metadata()?;
        let processed: ProcessedPayload = event.decode_payload()?;
        let record_count = processed.metrics.created
            + processed.metrics.updated
            + processed.metrics.unchanged;

        self.record_batch(event, sync, record_count).await?;

        let Some(final_batch) = SyncBatch::find()
            .filter(Column::SyncId.eq(sync.sync_id))
            .filter(Column::IsFinal.eq(true))
            .one(&self.ctx.db)
            .await?
        else {
            return Ok(SweepOutcome::Pending);
        };

        let recorded = SyncBatch::find()
            .filter(Column::SyncId.eq(sync.sync_id))
            .count(&self.ctx.db)
            .await?;
        if recorded < final_batch.batch_number as u64 {
            debug!(
                sync_id = %sync.sync_id,
                recorded,
                expected = final_batch.batch_number,
                "Run not fully processed; sweep deferred"
            );
            return Ok(SweepOutcome::Pending);
        }

        let cutoff = final_batch.sync_started_at;
        let result = EntityRecord::update_many()
            .col_expr(EntityColumn::DeletedAt, Expr::value(Some(to_db_time(Utc::now()))))
            .col_expr(EntityColumn::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(EntityColumn::DataSourceId.eq(event.data_source_id))
            .filter(EntityColumn::EntityType.eq(event.entity_type.as_str()))
            .filter(EntityColumn::DeletedAt.is_null())
            .filter(
                Condition::any()
                    .add(EntityColumn::SyncId.ne(sync.sync_id))
                    .add(EntityColumn::SyncId.is_null()),
            )
            .filter(EntityColumn::LastSeenAt.lt(cutoff))
            .exec(&self.ctx.db)
            .await?;

        if result.rows_affected > 0 {
            counter!("pipeline_sweeper_entities_deleted_total").increment(result.rows_affected);
        }
        info!(
            sync_id = %sync.sync_id,
            batches = final_batch.batch_number,
            deleted = result.rows_affected,
            "Sync run swept"
        );
        Ok(SweepOutcome::Swept(result.rows_affected))
    }

    async fn record_batch(
        &self,
        event: &EventEnvelope,
        sync: &SyncMetadata,
        record_count: usize,
    ) -> Result<(), PipelineError> {
        let row = sync_batch::ActiveModel {
            sync_id: Set(sync.sync_id),
            batch_number: Set(sync.batch_number),
            data_source_id: Set(event.data_source_id),
            entity_type: Set(event.entity_type.clone()),
            is_final: Set(sync.is_final_batch),
            record_count: Set(record_count as i32),
            sync_started_at: Set(to_db_time(sync.sync_started_at)),
            processed_at: Set(to_db_time(Utc::now())),
        };
        SyncBatch::insert(row)
            .on_conflict(
                OnConflict::columns([Column::SyncId, Column::BatchNumber])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.ctx.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SweeperDriver {
    fn name(&self) -> &'static str {
        "sweeper"
    }

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError> {
        self.sweep(&event).await?;
        Ok(())
    }
}
