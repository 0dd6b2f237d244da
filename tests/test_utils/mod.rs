//! Test utilities for pipeline testing.
//!
//! Sets up an in-memory SQLite database with migrations applied and wires
//! every stage onto an in-memory bus, with an in-memory connector standing in
//! for the external system.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Statement,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sync_pipeline::bus::{EventEnvelope, MemoryEventBus};
use sync_pipeline::config::AppConfig;
use sync_pipeline::connectors::{InMemoryConnector, IntegrationMetadata, Registry};
use sync_pipeline::context::PipelineContext;
use sync_pipeline::models::{data_source, entity, relationship, scheduled_job};
use sync_pipeline::normalization::{ALL_ENTITY_TYPES, EntityType, FieldMapNormalizer};
use sync_pipeline::pipeline::analyzer::default_analyzers;
use sync_pipeline::pipeline::{KeyMatchLinker, MemoryAlertSink};
use sync_pipeline::repositories::{FailedEventRepository, JobPayload, NewDataSource};
use sync_pipeline::scheduler::{JobScheduler, PollStats};

pub const INTEGRATION_TYPE: &str = "acme";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // Fixtures do not always satisfy cross-table relations.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Configuration tuned for fast tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    config.worker.redelivery_backoff_ms = 10;
    config
}

/// Every stage subscribed on an in-memory bus.
pub struct TestPipeline {
    pub db: DatabaseConnection,
    pub ctx: PipelineContext,
    pub bus: Arc<MemoryEventBus>,
    pub connector: Arc<InMemoryConnector>,
    pub alerts: Arc<MemoryAlertSink>,
    pub scheduler: JobScheduler,
    pub shutdown: CancellationToken,
}

impl TestPipeline {
    /// Pipeline whose connector serves pages of `page_size` records.
    pub async fn start(page_size: usize) -> Result<Self> {
        Self::start_with_config(page_size, test_config()).await
    }

    pub async fn start_with_config(page_size: usize, config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let bus = Arc::new(MemoryEventBus::with_dead_letter_sink(
            config.worker.clone(),
            shutdown.clone(),
            Arc::new(FailedEventRepository::new(db.clone())),
        ));
        let connector = Arc::new(InMemoryConnector::new(page_size));
        let alerts = Arc::new(MemoryAlertSink::new());

        let mut registry = Registry::new();
        registry.register_integration(
            IntegrationMetadata::new(INTEGRATION_TYPE, "Acme RMM", ALL_ENTITY_TYPES.to_vec()),
            connector.clone(),
            Arc::new(FieldMapNormalizer::new()),
        );
        registry.register_linker(INTEGRATION_TYPE, Arc::new(KeyMatchLinker::firewall_license()));
        registry.register_linker(INTEGRATION_TYPE, Arc::new(KeyMatchLinker::company_endpoint()));
        for analyzer in default_analyzers(config.analyzer.stale_identity_days) {
            registry.register_analyzer(analyzer);
        }

        let ctx = PipelineContext::new(
            config,
            db.clone(),
            bus.clone(),
            Arc::new(registry),
            alerts.clone(),
        );
        ctx.subscribe_stages().await?;

        Ok(Self {
            db,
            scheduler: JobScheduler::new(ctx.clone()),
            ctx,
            bus,
            connector,
            alerts,
            shutdown,
        })
    }

    pub async fn create_data_source(&self) -> Result<data_source::Model> {
        Ok(self
            .ctx
            .data_sources
            .create(NewDataSource {
                tenant_id: Uuid::new_v4(),
                integration_id: format!("acme-{}", Uuid::new_v4().simple()),
                integration_type: INTEGRATION_TYPE.to_string(),
                config: json!({}),
                credential_expiration_at: None,
            })
            .await?)
    }

    pub async fn enqueue_sync(
        &self,
        data_source: &data_source::Model,
        entity_type: EntityType,
    ) -> Result<scheduled_job::Model> {
        Ok(self
            .ctx
            .jobs
            .enqueue(
                &self.db,
                data_source,
                &entity_type.sync_action(),
                &JobPayload::default(),
                Utc::now(),
                None,
            )
            .await?)
    }

    /// One poll at `now`, then wait until every triggered stage has finished.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollStats> {
        let stats = self.scheduler.poll_jobs(now).await?;
        self.bus.wait_idle().await;
        Ok(stats)
    }

    /// Poll until nothing is claimable, following every page of a run. The
    /// first poll runs at `now`; later polls keep the same offset from the
    /// wall clock so continuation jobs scheduled in between are due.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<()> {
        let offset = now - Utc::now();
        for _ in 0..100 {
            if self.poll_once(Utc::now() + offset).await?.claimed == 0 {
                return Ok(());
            }
        }
        anyhow::bail!("job queue did not drain")
    }

    /// Enqueue one sync of `entity_type` and run it to completion.
    pub async fn sync(&self, data_source: &data_source::Model, entity_type: EntityType) -> Result<()> {
        self.enqueue_sync(data_source, entity_type).await?;
        self.drain(Utc::now()).await
    }

    pub async fn live_entities(
        &self,
        data_source_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<entity::Model>> {
        Ok(entity::Entity::find()
            .filter(entity::Column::DataSourceId.eq(data_source_id))
            .filter(entity::Column::EntityType.eq(entity_type.as_str()))
            .filter(entity::Column::DeletedAt.is_null())
            .order_by_asc(entity::Column::ExternalId)
            .all(&self.db)
            .await?)
    }

    pub async fn entity_by_external_id(
        &self,
        data_source_id: Uuid,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<entity::Model> {
        entity::Entity::find()
            .filter(entity::Column::DataSourceId.eq(data_source_id))
            .filter(entity::Column::EntityType.eq(entity_type.as_str()))
            .filter(entity::Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| anyhow::anyhow!("entity {external_id} not found"))
    }

    pub async fn relationships(&self, data_source_id: Uuid) -> Result<Vec<relationship::Model>> {
        Ok(relationship::Entity::find()
            .filter(relationship::Column::DataSourceId.eq(data_source_id))
            .all(&self.db)
            .await?)
    }

    /// Jobs of a data source, oldest first.
    pub async fn jobs(&self, data_source_id: Uuid) -> Result<Vec<scheduled_job::Model>> {
        Ok(scheduled_job::Entity::find()
            .filter(scheduled_job::Column::DataSourceId.eq(data_source_id))
            .order_by_asc(scheduled_job::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn reload_data_source(&self, id: Uuid) -> Result<data_source::Model> {
        self.ctx
            .data_sources
            .find(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("data source {id} not found"))
    }

    /// Published events for one stage, in publish order.
    pub async fn events(&self, stage: &str) -> Vec<EventEnvelope> {
        self.bus.published_matching(&format!("*.{stage}.*")).await
    }
}

impl Drop for TestPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// `count` identity records with recent logins.
pub fn identities(count: usize) -> Vec<Value> {
    let last_login = Utc::now().to_rfc3339();
    (0..count)
        .map(|i| {
            json!({
                "id": format!("user-{i:04}"),
                "email": format!("user{i}@example.com"),
                "enabled": true,
                "lastLoginAt": last_login,
            })
        })
        .collect()
}

/// `count` company records named `Company <n>`.
pub fn companies(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"id": format!("co-{i:04}"), "name": format!("Company {i}")}))
        .collect()
}
