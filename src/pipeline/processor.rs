//! Processor stage
//!
//! Normalizes a fetched page and reconciles it with the stored entities of
//! the same data source and entity type. Each chunk costs one read and at
//! most three writes: insert the new records, upsert the changed ones and
//! touch the unchanged ones so the sweeper knows they are still present.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{
    EventEnvelope, EventHandler, FetchedPayload, ProcessMetrics, ProcessedPayload, SkippedRecord,
    Stage,
};
use crate::context::PipelineContext;
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::entity::{self, ActiveModel, Column, Entity as EntityRecord, STATE_NORMAL};
use crate::normalization::{EntityType, Normalizer, content_hash, parse_entity_type};

/// A record that survived normalization.
#[derive(Debug, Clone)]
struct PreparedRecord {
    external_id: String,
    raw: Value,
    normalized: Value,
    data_hash: String,
}

/// Normalize `records`, isolating failures and collapsing duplicate external
/// ids. The last occurrence of an id wins but keeps the first position.
fn prepare_records(
    normalizer: &dyn Normalizer,
    entity_type: EntityType,
    records: Vec<Value>,
) -> (Vec<PreparedRecord>, Vec<SkippedRecord>) {
    let mut prepared: Vec<PreparedRecord> = Vec::with_capacity(records.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut skipped = Vec::new();

    for (index, raw) in records.into_iter().enumerate() {
        let record = match normalizer.normalize(entity_type, &raw) {
            Ok(record) => record,
            Err(err) => {
                let external_id = raw
                    .get("id")
                    .and_then(|id| match id {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    });
                skipped.push(SkippedRecord {
                    index,
                    external_id,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let data_hash = content_hash(&record.normalized);
        let next = PreparedRecord {
            external_id: record.external_id,
            raw,
            normalized: record.normalized,
            data_hash,
        };
        match positions.get(&next.external_id) {
            Some(&position) => {
                debug!(external_id = %next.external_id, "Duplicate external id in batch; last occurrence wins");
                prepared[position] = next;
            }
            None => {
                positions.insert(next.external_id.clone(), prepared.len());
                prepared.push(next);
            }
        }
    }

    (prepared, skipped)
}

/// Consumes `*.fetched.*` events.
pub struct ProcessorDriver {
    ctx: PipelineContext,
}

impl ProcessorDriver {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Reconcile one fetched page with the entity table.
    #[instrument(skip_all, fields(data_source_id = %event.data_source_id, entity_type = %event.entity_type))]
    pub async fn process(&self, event: &EventEnvelope) -> Result<ProcessedPayload, PipelineError> {
        let started = Instant::now();
        let sync = event.require_sync_metadata()?;
        let fetched: FetchedPayload = event.decode_payload()?;
        let entity_type = parse_entity_type(&event.entity_type).ok_or_else(|| {
            PipelineError::UnsupportedEntityType {
                integration_type: event.integration_type.clone(),
                entity_type: event.entity_type.clone(),
            }
        })?;
        let normalizer = self.ctx.registry.normalizer(&event.integration_type)?;

        let (prepared, skipped) = prepare_records(normalizer.as_ref(), entity_type, fetched.records);
        for record in &skipped {
            warn!(
                index = record.index,
                external_id = ?record.external_id,
                reason = %record.reason,
                "Record skipped"
            );
        }

        let mut metrics = ProcessMetrics {
            skipped: skipped.len(),
            ..ProcessMetrics::default()
        };
        let mut changed_entity_ids = Vec::new();
        let now = to_db_time(Utc::now());
        let chunk_size = self.ctx.config.processor.chunk_size.max(1);

        for chunk in prepared.chunks(chunk_size) {
            self.reconcile_chunk(event, entity_type, sync.sync_id, now, chunk, &mut metrics, &mut changed_entity_ids)
                .await?;
        }

        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("pipeline_processor_batch_duration_ms").record(metrics.elapsed_ms as f64);
        for (outcome, count) in [
            ("created", metrics.created),
            ("updated", metrics.updated),
            ("unchanged", metrics.unchanged),
            ("skipped", metrics.skipped),
        ] {
            counter!("pipeline_processor_records_total", "outcome" => outcome).increment(count as u64);
        }

        info!(
            sync_id = %sync.sync_id,
            batch_number = sync.batch_number,
            created = metrics.created,
            updated = metrics.updated,
            unchanged = metrics.unchanged,
            skipped = metrics.skipped,
            queries = metrics.queries,
            mutations = metrics.mutations,
            "Batch processed"
        );

        Ok(ProcessedPayload {
            changed_entity_ids,
            metrics,
            skipped,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_chunk(
        &self,
        event: &EventEnvelope,
        entity_type: EntityType,
        sync_id: Uuid,
        now: DateTimeWithTimeZone,
        chunk: &[PreparedRecord],
        metrics: &mut ProcessMetrics,
        changed: &mut Vec<Uuid>,
    ) -> Result<(), PipelineError> {
        let external_ids: Vec<&str> = chunk.iter().map(|r| r.external_id.as_str()).collect();
        let existing: HashMap<String, entity::Model> = EntityRecord::find()
            .filter(Column::DataSourceId.eq(event.data_source_id))
            .filter(Column::EntityType.eq(entity_type.as_str()))
            .filter(Column::ExternalId.is_in(external_ids))
            .filter(Column::DeletedAt.is_null())
            .all(&self.ctx.db)
            .await?
            .into_iter()
            .map(|model| (model.external_id.clone(), model))
            .collect();
        metrics.queries += 1;

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut touches = Vec::new();

        for record in chunk {
            match existing.get(&record.external_id) {
                None => {
                    let id = Uuid::new_v4();
                    creates.push(ActiveModel {
                        id: Set(id),
                        tenant_id: Set(event.tenant_id),
                        data_source_id: Set(event.data_source_id),
                        integration_id: Set(event.integration_id.clone()),
                        entity_type: Set(entity_type.as_str().to_string()),
                        external_id: Set(record.external_id.clone()),
                        data_hash: Set(record.data_hash.clone()),
                        raw_data: Set(record.raw.clone()),
                        normalized_data: Set(record.normalized.clone()),
                        state: Set(STATE_NORMAL.to_string()),
                        tags: Set(json!([])),
                        last_seen_at: Set(now),
                        sync_id: Set(Some(sync_id)),
                        deleted_at: Set(None),
                        created_at: Set(now),
                        updated_at: Set(now),
                    });
                    changed.push(id);
                    metrics.created += 1;
                }
                Some(current) if current.data_hash != record.data_hash => {
                    updates.push(ActiveModel {
                        id: Set(current.id),
                        tenant_id: Set(current.tenant_id),
                        data_source_id: Set(current.data_source_id),
                        integration_id: Set(current.integration_id.clone()),
                        entity_type: Set(current.entity_type.clone()),
                        external_id: Set(current.external_id.clone()),
                        data_hash: Set(record.data_hash.clone()),
                        raw_data: Set(record.raw.clone()),
                        normalized_data: Set(record.normalized.clone()),
                        state: Set(current.state.clone()),
                        tags: Set(current.tags.clone()),
                        last_seen_at: Set(now),
                        sync_id: Set(Some(sync_id)),
                        deleted_at: Set(None),
                        created_at: Set(current.created_at),
                        updated_at: Set(now),
                    });
                    changed.push(current.id);
                    metrics.updated += 1;
                }
                Some(current) => {
                    touches.push(current.id);
                    metrics.unchanged += 1;
                }
            }
        }

        if creates.is_empty() && updates.is_empty() && touches.is_empty() {
            return Ok(());
        }

        let txn = self.ctx.db.begin().await?;
        if !creates.is_empty() {
            EntityRecord::insert_many(creates)
                .exec_without_returning(&txn)
                .await?;
            metrics.mutations += 1;
        }
        if !updates.is_empty() {
            EntityRecord::insert_many(updates)
                .on_conflict(
                    OnConflict::column(Column::Id)
                        .update_columns([
                            Column::DataHash,
                            Column::RawData,
                            Column::NormalizedData,
                            Column::LastSeenAt,
                            Column::SyncId,
                            Column::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
            metrics.mutations += 1;
        }
        if !touches.is_empty() {
            EntityRecord::update_many()
                .col_expr(Column::LastSeenAt, Expr::value(now))
                .col_expr(Column::SyncId, Expr::value(Some(sync_id)))
                .filter(Column::Id.is_in(touches))
                .exec(&txn)
                .await?;
            metrics.mutations += 1;
        }
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ProcessorDriver {
    fn name(&self) -> &'static str {
        "processor"
    }

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError> {
        let payload = self.process(&event).await?;
        let next = event.next_stage(Stage::Processed, json!(payload));
        self.ctx.bus.publish(&next.topic(), next).await?;
        Ok(())
    }
}
