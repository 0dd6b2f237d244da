//! Linker stage
//!
//! Derives relationships between the live entities of one data source.
//! A [`Linker`] only matches; the [`LinkerDriver`] loads its inputs, writes
//! the edges that are missing in one insert and removes the edges of that
//! linker that are no longer derived, such as edges to a soft-deleted child
//! or to a parent whose key changed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::bus::{EventEnvelope, EventHandler, LinkedPayload, ProcessedPayload, Stage};
use crate::context::PipelineContext;
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::entity::{self, Column as EntityColumn, Entity as EntityRecord};
use crate::models::relationship::{self, Column, Entity as Relationship};
use crate::normalization::{EntityType, parse_entity_type};

pub const FIREWALL_LICENSE: &str = "firewall_license";
pub const COMPANY_ENDPOINT: &str = "company_endpoint";

/// A relationship a linker wants to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipCandidate {
    pub parent_entity_id: Uuid,
    pub child_entity_id: Uuid,
    pub relationship_type: String,
}

/// Live entities of one data source, grouped by type.
#[derive(Debug, Default)]
pub struct EntityGraph {
    entities: HashMap<EntityType, Vec<entity::Model>>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity_type: EntityType, entities: Vec<entity::Model>) {
        self.entities.insert(entity_type, entities);
    }

    pub fn contains(&self, entity_type: EntityType) -> bool {
        self.entities.contains_key(&entity_type)
    }

    pub fn of_type(&self, entity_type: EntityType) -> &[entity::Model] {
        self.entities
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub trait Linker: Send + Sync {
    fn name(&self) -> &str;

    /// Type of every edge this linker derives. Existing edges of this type
    /// whose parent is live are owned by the linker and pruned when no longer
    /// matched.
    fn relationship_type(&self) -> &str;

    fn parent_entity_type(&self) -> EntityType;

    /// Entity types read by `match_relationships`. A change to any of them
    /// triggers this linker.
    fn input_entity_types(&self) -> &[EntityType];

    fn match_relationships(&self, graph: &EntityGraph) -> Vec<RelationshipCandidate>;
}

/// Links parents to children whose normalized fields hold the same key.
#[derive(Debug, Clone)]
pub struct KeyMatchLinker {
    relationship_type: String,
    parent_type: EntityType,
    parent_field: String,
    child_type: EntityType,
    child_field: String,
    inputs: [EntityType; 2],
}

impl KeyMatchLinker {
    pub fn new(
        relationship_type: impl Into<String>,
        parent_type: EntityType,
        parent_field: impl Into<String>,
        child_type: EntityType,
        child_field: impl Into<String>,
    ) -> Self {
        Self {
            relationship_type: relationship_type.into(),
            parent_type,
            parent_field: parent_field.into(),
            child_type,
            child_field: child_field.into(),
            inputs: [parent_type, child_type],
        }
    }

    /// firewall.serial ↔ license.serialNumber
    pub fn firewall_license() -> Self {
        Self::new(
            FIREWALL_LICENSE,
            EntityType::Firewalls,
            "serial",
            EntityType::Licenses,
            "serialNumber",
        )
    }

    /// company.externalId ↔ endpoint.companyId
    pub fn company_endpoint() -> Self {
        Self::new(
            COMPANY_ENDPOINT,
            EntityType::Companies,
            "externalId",
            EntityType::Endpoints,
            "companyId",
        )
    }
}

fn match_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Linker for KeyMatchLinker {
    fn name(&self) -> &str {
        &self.relationship_type
    }

    fn relationship_type(&self) -> &str {
        &self.relationship_type
    }

    fn parent_entity_type(&self) -> EntityType {
        self.parent_type
    }

    fn input_entity_types(&self) -> &[EntityType] {
        &self.inputs
    }

    fn match_relationships(&self, graph: &EntityGraph) -> Vec<RelationshipCandidate> {
        let mut parents: HashMap<String, Uuid> = HashMap::new();
        for parent in graph.of_type(self.parent_type) {
            if let Some(key) = match_key(parent.field(&self.parent_field)) {
                parents.entry(key).or_insert(parent.id);
            }
        }

        graph
            .of_type(self.child_type)
            .iter()
            .filter_map(|child| {
                let key = match_key(child.field(&self.child_field))?;
                let parent_entity_id = *parents.get(&key)?;
                Some(RelationshipCandidate {
                    parent_entity_id,
                    child_entity_id: child.id,
                    relationship_type: self.relationship_type.clone(),
                })
            })
            .collect()
    }
}

/// Per data source mutexes; an entry lives only while someone holds or
/// waits on it.
#[derive(Default)]
struct DataSourceLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DataSourceLocks {
    async fn acquire(&self, data_source_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(data_source_id)
            .or_default()
            .clone()
    }

    async fn release(&self, data_source_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        // Clones are only handed out under the map lock, so a count of one
        // means nobody else holds or waits on it.
        if locks
            .get(&data_source_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&data_source_id);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Edges written and removed by one linker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOutcome {
    pub created: usize,
    pub removed: usize,
}

/// Consumes `*.processed.*` events.
pub struct LinkerDriver {
    ctx: PipelineContext,
    // Serializes check-then-create per data source within this process.
    locks: DataSourceLocks,
}

impl LinkerDriver {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            locks: DataSourceLocks::default(),
        }
    }

    /// Run every linker the event's entity type triggers.
    #[instrument(skip_all, fields(data_source_id = %event.data_source_id, entity_type = %event.entity_type))]
    pub async fn link(&self, event: &EventEnvelope) -> Result<LinkOutcome, PipelineError> {
        let Some(entity_type) = parse_entity_type(&event.entity_type) else {
            return Ok(LinkOutcome::default());
        };
        let linkers = self
            .ctx
            .registry
            .linkers_for(&event.integration_type, entity_type);
        if linkers.is_empty() {
            return Ok(LinkOutcome::default());
        }

        let lock = self.locks.acquire(event.data_source_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.reconcile(event, &linkers).await
        };
        self.locks.release(event.data_source_id, lock).await;
        outcome
    }

    async fn reconcile(
        &self,
        event: &EventEnvelope,
        linkers: &[Arc<dyn Linker>],
    ) -> Result<LinkOutcome, PipelineError> {
        let mut graph = EntityGraph::new();
        for linker in linkers {
            for input in linker.input_entity_types() {
                if graph.contains(*input) {
                    continue;
                }
                let entities = EntityRecord::find()
                    .filter(EntityColumn::DataSourceId.eq(event.data_source_id))
                    .filter(EntityColumn::EntityType.eq(input.as_str()))
                    .filter(EntityColumn::DeletedAt.is_null())
                    .order_by_asc(EntityColumn::CreatedAt)
                    .all(&self.ctx.db)
                    .await?;
                graph.insert(*input, entities);
            }
        }

        let mut seen = HashSet::new();
        let candidates: Vec<RelationshipCandidate> = linkers
            .iter()
            .flat_map(|linker| {
                let matched = linker.match_relationships(&graph);
                debug!(linker = linker.name(), matched = matched.len(), "Linker matched");
                matched
            })
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect();

        // Every live parent of every linker, so edges that are no longer
        // matched are loaded alongside the ones that still are.
        let parent_ids: HashSet<Uuid> = linkers
            .iter()
            .flat_map(|linker| graph.of_type(linker.parent_entity_type()))
            .map(|parent| parent.id)
            .collect();
        if parent_ids.is_empty() {
            return Ok(LinkOutcome::default());
        }
        let owned_types: Vec<String> = linkers
            .iter()
            .map(|linker| linker.relationship_type().to_string())
            .collect();
        let existing = Relationship::find()
            .filter(Column::DataSourceId.eq(event.data_source_id))
            .filter(Column::ParentEntityId.is_in(parent_ids))
            .filter(Column::RelationshipType.is_in(owned_types))
            .all(&self.ctx.db)
            .await?;

        let existing_keys: HashSet<(Uuid, Uuid, &str)> = existing
            .iter()
            .map(|r| (r.parent_entity_id, r.child_entity_id, r.relationship_type.as_str()))
            .collect();
        let now = to_db_time(Utc::now());
        let missing: Vec<relationship::ActiveModel> = candidates
            .iter()
            .filter(|c| {
                !existing_keys.contains(&(
                    c.parent_entity_id,
                    c.child_entity_id,
                    c.relationship_type.as_str(),
                ))
            })
            .map(|c| relationship::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(event.tenant_id),
                data_source_id: Set(event.data_source_id),
                parent_entity_id: Set(c.parent_entity_id),
                child_entity_id: Set(c.child_entity_id),
                relationship_type: Set(c.relationship_type.clone()),
                metadata: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            })
            .collect();

        let stale: Vec<Uuid> = existing
            .iter()
            .filter(|r| {
                !seen.contains(&RelationshipCandidate {
                    parent_entity_id: r.parent_entity_id,
                    child_entity_id: r.child_entity_id,
                    relationship_type: r.relationship_type.clone(),
                })
            })
            .map(|r| r.id)
            .collect();

        let outcome = LinkOutcome {
            created: missing.len(),
            removed: stale.len(),
        };
        if outcome.created > 0 {
            Relationship::insert_many(missing)
                .exec_without_returning(&self.ctx.db)
                .await?;
            counter!("pipeline_linker_relationships_created_total")
                .increment(outcome.created as u64);
        }
        if outcome.removed > 0 {
            Relationship::delete_many()
                .filter(Column::Id.is_in(stale))
                .exec(&self.ctx.db)
                .await?;
            counter!("pipeline_linker_relationships_removed_total")
                .increment(outcome.removed as u64);
        }
        if outcome.created > 0 || outcome.removed > 0 {
            info!(created = outcome.created, removed = outcome.removed, "Relationships reconciled");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl EventHandler for LinkerDriver {
    fn name(&self) -> &'static str {
        "linker"
    }

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError> {
        let processed: ProcessedPayload = event.decode_payload()?;
        let outcome = self.link(&event).await?;

        let payload = LinkedPayload {
            changed_entity_ids: processed.changed_entity_ids,
            relationships_created: outcome.created,
            relationships_removed: outcome.removed,
        };
        let next = event.next_stage(Stage::Linked, json!(payload));
        self.ctx.bus.publish(&next.topic(), next).await?;
        Ok(())
    }
}
