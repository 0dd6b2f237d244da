//! Analyzer stage
//!
//! Evaluates entities for alertable conditions after linking. Each
//! [`Analyzer`] sees a working set of its target entity type, returns tag and
//! state changes plus an optional finding per entity, and the
//! [`AnalyzerDriver`] applies the patches in one batched upsert before handing
//! the report to the [`AlertSink`].
//!
//! Reports are a snapshot of current state: an evaluated entity without a
//! finding means any open alert for it should resolve.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{EventEnvelope, EventHandler, LinkedPayload};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::models::entity::{
    self, ActiveModel, Column as EntityColumn, Entity as EntityRecord, STATE_NORMAL,
    tags_to_json,
};
use crate::models::relationship::{self, Column as RelationshipColumn, Entity as Relationship};
use crate::normalization::{EntityType, parse_entity_type};
use crate::pipeline::linker::FIREWALL_LICENSE;

pub const STATE_WARN: &str = "warn";
pub const TAG_STALE: &str = "stale";
pub const TAG_UNLICENSED: &str = "unlicensed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Deterministic alert identity: hex SHA-256 of `analyzer|alert_type|entity_id`.
pub fn fingerprint(analyzer: &str, alert_type: &str, entity_id: Uuid) -> String {
    hex::encode(Sha256::digest(format!("{analyzer}|{alert_type}|{entity_id}").as_bytes()))
}

/// An alertable condition that currently holds for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub fingerprint: String,
    pub analyzer: String,
    pub alert_type: String,
    pub entity_id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub evidence: Value,
}

/// The part of a finding an analyzer decides; identity is filled in by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct FindingDetail {
    pub severity: Severity,
    pub message: String,
    pub evidence: Value,
}

/// Result of evaluating one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub tags_add: Vec<String>,
    pub tags_remove: Vec<String>,
    /// `None` leaves the state as is
    pub state: Option<String>,
    pub finding: Option<FindingDetail>,
}

/// Everything one analyzer run sees besides the entity itself.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub tenant_id: Uuid,
    pub data_source_id: Uuid,
    pub integration_type: String,
    pub now: DateTime<Utc>,
    relationships: HashMap<Uuid, Vec<relationship::Model>>,
}

impl AnalysisContext {
    pub fn new(event: &EventEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: event.tenant_id,
            data_source_id: event.data_source_id,
            integration_type: event.integration_type.clone(),
            now,
            relationships: HashMap::new(),
        }
    }

    pub fn with_relationships(mut self, relationships: Vec<relationship::Model>) -> Self {
        for relationship in relationships {
            self.relationships
                .entry(relationship.parent_entity_id)
                .or_default()
                .push(relationship);
        }
        self
    }

    /// Whether `parent` has at least one outgoing edge of `relationship_type`.
    /// The driver only loads edges whose child is live.
    pub fn has_relationship(&self, parent: Uuid, relationship_type: &str) -> bool {
        self.relationships
            .get(&parent)
            .is_some_and(|edges| edges.iter().any(|r| r.relationship_type == relationship_type))
    }
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn alert_type(&self) -> &str;

    /// Restrict to one integration type; `None` runs for every integration.
    fn integration_type(&self) -> Option<&str> {
        None
    }

    /// Entity type evaluated.
    fn target_entity_type(&self) -> EntityType;

    /// Entity types whose changes can flip the condition.
    fn required_entity_types(&self) -> &[EntityType];

    /// Whether a correct answer needs the whole target set.
    fn requires_full_context(&self) -> bool {
        false
    }

    /// Targeted query for entities that might qualify or disqualify without
    /// having changed. Only used by incremental analyzers.
    fn candidates(&self, _ctx: &AnalysisContext) -> Option<Condition> {
        None
    }

    fn evaluate(&self, entity: &entity::Model, ctx: &AnalysisContext) -> Evaluation;
}

/// Enabled identities that have not logged in within the threshold.
#[derive(Debug, Clone)]
pub struct StaleIdentityAnalyzer {
    threshold: Duration,
}

impl StaleIdentityAnalyzer {
    pub fn new(threshold_days: i64) -> Self {
        Self {
            threshold: Duration::days(threshold_days),
        }
    }
}

impl Analyzer for StaleIdentityAnalyzer {
    fn name(&self) -> &str {
        "stale_identity"
    }

    fn alert_type(&self) -> &str {
        "identity.stale"
    }

    fn target_entity_type(&self) -> EntityType {
        EntityType::Identities
    }

    fn required_entity_types(&self) -> &[EntityType] {
        &[EntityType::Identities]
    }

    // Enabled, not yet flagged identities whose last login may be past the
    // cutoff. Stored offsets are within a day of UTC, so comparing the text
    // against a bound one day later keeps every stale login; `evaluate`
    // makes the exact call.
    fn candidates(&self, ctx: &AnalysisContext) -> Option<Condition> {
        let bound = (ctx.now - self.threshold + Duration::days(1))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        Some(
            Condition::all()
                .add(Expr::cust_with_values(
                    "normalized_data ->> 'lastLoginAt' < ?",
                    [bound],
                ))
                .add(Expr::cust(
                    "COALESCE(CAST(normalized_data ->> 'enabled' AS TEXT), 'true') NOT IN ('false', '0')",
                ))
                .add(Expr::cust_with_values(
                    "CAST(tags AS TEXT) NOT LIKE ?",
                    [format!("%\"{TAG_STALE}\"%")],
                )),
        )
    }

    fn evaluate(&self, entity: &entity::Model, ctx: &AnalysisContext) -> Evaluation {
        let enabled = entity
            .field("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let last_login = entity
            .field("lastLoginAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match last_login {
            Some(last_login) if enabled && last_login < ctx.now - self.threshold => Evaluation {
                tags_add: vec![TAG_STALE.to_string()],
                finding: Some(FindingDetail {
                    severity: Severity::Medium,
                    message: format!(
                        "Identity {} has not logged in for more than {} days",
                        entity.external_id,
                        self.threshold.num_days()
                    ),
                    evidence: json!({
                        "lastLoginAt": last_login.to_rfc3339(),
                        "thresholdDays": self.threshold.num_days(),
                    }),
                }),
                ..Evaluation::default()
            },
            _ => Evaluation {
                tags_remove: vec![TAG_STALE.to_string()],
                ..Evaluation::default()
            },
        }
    }
}

/// Firewalls without a license edge.
#[derive(Debug, Clone, Default)]
pub struct UnlicensedFirewallAnalyzer;

impl Analyzer for UnlicensedFirewallAnalyzer {
    fn name(&self) -> &str {
        "unlicensed_firewall"
    }

    fn alert_type(&self) -> &str {
        "firewall.unlicensed"
    }

    fn target_entity_type(&self) -> EntityType {
        EntityType::Firewalls
    }

    fn required_entity_types(&self) -> &[EntityType] {
        &[EntityType::Firewalls, EntityType::Licenses]
    }

    fn requires_full_context(&self) -> bool {
        true
    }

    fn evaluate(&self, entity: &entity::Model, ctx: &AnalysisContext) -> Evaluation {
        if ctx.has_relationship(entity.id, FIREWALL_LICENSE) {
            return Evaluation {
                tags_remove: vec![TAG_UNLICENSED.to_string()],
                state: Some(STATE_NORMAL.to_string()),
                ..Evaluation::default()
            };
        }
        Evaluation {
            tags_add: vec![TAG_UNLICENSED.to_string()],
            state: Some(STATE_WARN.to_string()),
            finding: Some(FindingDetail {
                severity: Severity::High,
                message: format!("Firewall {} has no license", entity.external_id),
                evidence: json!({ "serial": entity.field("serial") }),
            }),
            ..Evaluation::default()
        }
    }
}

/// Output of one analyzer over one working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub analyzer: String,
    pub alert_type: String,
    pub tenant_id: Uuid,
    pub data_source_id: Uuid,
    pub findings: Vec<Finding>,
    pub evaluated_entity_ids: Vec<Uuid>,
    pub patched: usize,
}

#[derive(Debug, Clone, Error)]
pub enum AlertSinkError {
    #[error("alert sink unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of analysis reports (the alert manager).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn submit(&self, report: AnalysisReport) -> Result<(), AlertSinkError>;
}

/// Logs findings; used when no alert manager is wired in.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn submit(&self, report: AnalysisReport) -> Result<(), AlertSinkError> {
        for finding in &report.findings {
            info!(
                analyzer = %finding.analyzer,
                alert_type = %finding.alert_type,
                entity_id = %finding.entity_id,
                severity = ?finding.severity,
                fingerprint = %finding.fingerprint,
                message = %finding.message,
                "Finding"
            );
        }
        debug!(
            analyzer = %report.analyzer,
            evaluated = report.evaluated_entity_ids.len(),
            findings = report.findings.len(),
            "Analysis report submitted"
        );
        Ok(())
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    reports: Mutex<Vec<AnalysisReport>>,
    failing: AtomicBool,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<AnalysisReport> {
        self.reports.lock().await.clone()
    }

    /// Make every following submit fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn submit(&self, report: AnalysisReport) -> Result<(), AlertSinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AlertSinkError::Unavailable("memory sink set to fail".into()));
        }
        self.reports.lock().await.push(report);
        Ok(())
    }
}

/// Consumes `*.linked.*` events.
pub struct AnalyzerDriver {
    ctx: PipelineContext,
}

impl AnalyzerDriver {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Run every analyzer the event triggers and submit their reports.
    #[instrument(skip_all, fields(data_source_id = %event.data_source_id, entity_type = %event.entity_type))]
    pub async fn analyze(&self, event: &EventEnvelope) -> Result<Vec<AnalysisReport>, PipelineError> {
        let linked: LinkedPayload = event.decode_payload()?;
        let Some(entity_type) = parse_entity_type(&event.entity_type) else {
            return Ok(Vec::new());
        };

        let mut reports = Vec::new();
        for analyzer in self.ctx.registry.analyzers_for(&event.integration_type, entity_type) {
            let Some(report) = self
                .run_analyzer(analyzer.as_ref(), event, &linked.changed_entity_ids)
                .await?
            else {
                continue;
            };

            if let Err(err) = self.ctx.alert_sink.submit(report.clone()).await {
                error!(analyzer = %report.analyzer, error = %err, "Alert sink rejected report");
                counter!("pipeline_alert_sink_errors_total").increment(1);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    async fn working_set(
        &self,
        analyzer: &dyn Analyzer,
        event: &EventEnvelope,
        changed: &[Uuid],
        ctx: &AnalysisContext,
    ) -> Result<Vec<entity::Model>, PipelineError> {
        let target = analyzer.target_entity_type();
        let base = || {
            EntityRecord::find()
                .filter(EntityColumn::DataSourceId.eq(event.data_source_id))
                .filter(EntityColumn::EntityType.eq(target.as_str()))
                .filter(EntityColumn::DeletedAt.is_null())
                .order_by_asc(EntityColumn::CreatedAt)
        };

        if analyzer.requires_full_context() || changed.is_empty() {
            return Ok(base().all(&self.ctx.db).await?);
        }

        // Keyed by id so changed rows and candidates collapse.
        let mut set: BTreeMap<Uuid, entity::Model> = BTreeMap::new();
        for model in base()
            .filter(EntityColumn::Id.is_in(changed.iter().copied()))
            .all(&self.ctx.db)
            .await?
        {
            set.insert(model.id, model);
        }
        if let Some(condition) = analyzer.candidates(ctx) {
            for model in base().filter(condition).all(&self.ctx.db).await? {
                set.entry(model.id).or_insert(model);
            }
        }
        Ok(set.into_values().collect())
    }

    /// Outgoing edges of `parents` whose child entity has not been deleted.
    async fn live_relationships(
        &self,
        parents: &[Uuid],
    ) -> Result<Vec<relationship::Model>, PipelineError> {
        let relationships = Relationship::find()
            .filter(RelationshipColumn::ParentEntityId.is_in(parents.iter().copied()))
            .all(&self.ctx.db)
            .await?;
        if relationships.is_empty() {
            return Ok(relationships);
        }

        let child_ids: HashSet<Uuid> = relationships.iter().map(|r| r.child_entity_id).collect();
        let live: HashSet<Uuid> = EntityRecord::find()
            .select_only()
            .column(EntityColumn::Id)
            .filter(EntityColumn::Id.is_in(child_ids))
            .filter(EntityColumn::DeletedAt.is_null())
            .into_tuple::<Uuid>()
            .all(&self.ctx.db)
            .await?
            .into_iter()
            .collect();
        Ok(relationships
            .into_iter()
            .filter(|r| live.contains(&r.child_entity_id))
            .collect())
    }

    async fn run_analyzer(
        &self,
        analyzer: &dyn Analyzer,
        event: &EventEnvelope,
        changed: &[Uuid],
    ) -> Result<Option<AnalysisReport>, PipelineError> {
        let ctx = AnalysisContext::new(event, Utc::now());
        let entities = self.working_set(analyzer, event, changed, &ctx).await?;
        if entities.is_empty() {
            debug!(analyzer = analyzer.name(), "Empty working set");
            return Ok(None);
        }

        let ids: Vec<Uuid> = entities.iter().map(|e| e.id).collect();
        let relationships = self.live_relationships(&ids).await?;
        let ctx = ctx.with_relationships(relationships);

        let mut findings = Vec::new();
        let mut patches = Vec::new();
        for entity in &entities {
            let evaluation = analyzer.evaluate(entity, &ctx);

            let mut tags = entity.tag_set();
            for tag in &evaluation.tags_remove {
                tags.remove(tag);
            }
            tags.extend(evaluation.tags_add.iter().cloned());
            let state = evaluation.state.unwrap_or_else(|| entity.state.clone());
            if tags != entity.tag_set() || state != entity.state {
                patches.push(ActiveModel {
                    tags: Set(tags_to_json(&tags)),
                    state: Set(state),
                    ..full_active_model(entity)
                });
            }

            if let Some(detail) = evaluation.finding {
                findings.push(Finding {
                    fingerprint: fingerprint(analyzer.name(), analyzer.alert_type(), entity.id),
                    analyzer: analyzer.name().to_string(),
                    alert_type: analyzer.alert_type().to_string(),
                    entity_id: entity.id,
                    severity: detail.severity,
                    message: detail.message,
                    evidence: detail.evidence,
                });
            }
        }

        let patched = patches.len();
        if patched > 0 {
            EntityRecord::insert_many(patches)
                .on_conflict(
                    OnConflict::column(EntityColumn::Id)
                        .update_columns([EntityColumn::Tags, EntityColumn::State])
                        .to_owned(),
                )
                .exec_without_returning(&self.ctx.db)
                .await?;
        }

        counter!("pipeline_analyzer_findings_total", "analyzer" => analyzer.name().to_string())
            .increment(findings.len() as u64);
        if !findings.is_empty() {
            warn!(
                analyzer = analyzer.name(),
                findings = findings.len(),
                evaluated = ids.len(),
                "Analyzer raised findings"
            );
        }
        debug!(analyzer = analyzer.name(), evaluated = ids.len(), patched, "Analyzer finished");

        Ok(Some(AnalysisReport {
            analyzer: analyzer.name().to_string(),
            alert_type: analyzer.alert_type().to_string(),
            tenant_id: event.tenant_id,
            data_source_id: event.data_source_id,
            findings,
            evaluated_entity_ids: ids,
            patched,
        }))
    }
}

/// Every column set from `model`; the upsert only writes tags and state.
fn full_active_model(model: &entity::Model) -> ActiveModel {
    ActiveModel {
        id: Set(model.id),
        tenant_id: Set(model.tenant_id),
        data_source_id: Set(model.data_source_id),
        integration_id: Set(model.integration_id.clone()),
        entity_type: Set(model.entity_type.clone()),
        external_id: Set(model.external_id.clone()),
        data_hash: Set(model.data_hash.clone()),
        raw_data: Set(model.raw_data.clone()),
        normalized_data: Set(model.normalized_data.clone()),
        state: Set(model.state.clone()),
        tags: Set(model.tags.clone()),
        last_seen_at: Set(model.last_seen_at),
        sync_id: Set(model.sync_id),
        deleted_at: Set(model.deleted_at),
        created_at: Set(model.created_at),
        updated_at: Set(model.updated_at),
    }
}

#[async_trait]
impl EventHandler for AnalyzerDriver {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError> {
        self.analyze(&event).await?;
        Ok(())
    }
}

/// Shared default analyzers.
pub fn default_analyzers(stale_identity_days: i64) -> Vec<Arc<dyn Analyzer>> {
    vec![
        Arc::new(StaleIdentityAnalyzer::new(stale_identity_days)),
        Arc::new(UnlicensedFirewallAnalyzer),
    ]
}
