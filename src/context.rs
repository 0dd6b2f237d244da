//! Pipeline context
//!
//! Everything a stage needs, built once at startup and cloned into each
//! worker: configuration, database handle, event bus, integration registry
//! and the alert sink. Nothing in the pipeline reaches for globals.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::info;
use uuid::Uuid;

use crate::bus::{BusError, EventBus, EventHandler, Stage, stage_pattern};
use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::pipeline::adapter::AdapterDriver;
use crate::pipeline::analyzer::{AlertSink, AnalyzerDriver};
use crate::pipeline::linker::LinkerDriver;
use crate::pipeline::processor::ProcessorDriver;
use crate::pipeline::sweeper::SweeperDriver;
use crate::repositories::{DataSourceRepository, ScheduledJobRepository};

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<Registry>,
    pub alert_sink: Arc<dyn AlertSink>,
    pub jobs: ScheduledJobRepository,
    pub data_sources: DataSourceRepository,
}

impl PipelineContext {
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        bus: Arc<dyn EventBus>,
        registry: Arc<Registry>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        let jobs = ScheduledJobRepository::new(db.clone(), config.scheduler.clone());
        let data_sources = DataSourceRepository::new(db.clone());
        Self {
            config,
            db,
            bus,
            registry,
            alert_sink,
            jobs,
            data_sources,
        }
    }

    /// Attach every stage worker to its topic pattern.
    ///
    /// The sweeper and the linker both consume `processed` events; neither
    /// depends on the other.
    pub async fn subscribe_stages(&self) -> Result<Vec<Uuid>, BusError> {
        let stages: Vec<(Stage, Arc<dyn EventHandler>)> = vec![
            (Stage::Sync, Arc::new(AdapterDriver::new(self.clone()))),
            (Stage::Fetched, Arc::new(ProcessorDriver::new(self.clone()))),
            (Stage::Processed, Arc::new(SweeperDriver::new(self.clone()))),
            (Stage::Processed, Arc::new(LinkerDriver::new(self.clone()))),
            (Stage::Linked, Arc::new(AnalyzerDriver::new(self.clone()))),
        ];

        let mut subscriptions = Vec::with_capacity(stages.len());
        for (stage, handler) in stages {
            let pattern = stage_pattern(stage);
            let name = handler.name();
            let id = self.bus.subscribe(&pattern, handler).await?;
            info!(pattern = %pattern, handler = name, subscription_id = %id, "Stage subscribed");
            subscriptions.push(id);
        }
        Ok(subscriptions)
    }
}
