//! # Sync Pipeline Main Entry Point
//!
//! Wires configuration, storage, the event bus and every stage, then runs
//! the job scheduler, the sync planner and the status server until Ctrl-C.

use std::sync::Arc;

use sync_pipeline::bus::MemoryEventBus;
use sync_pipeline::config::{AppConfig, ConfigLoader};
use sync_pipeline::connectors::{InMemoryConnector, IntegrationMetadata, Registry};
use sync_pipeline::context::PipelineContext;
use sync_pipeline::normalization::{ALL_ENTITY_TYPES, FieldMapNormalizer};
use sync_pipeline::pipeline::analyzer::default_analyzers;
use sync_pipeline::pipeline::{KeyMatchLinker, TracingAlertSink};
use sync_pipeline::repositories::FailedEventRepository;
use sync_pipeline::scheduler::{JobScheduler, SyncPlanner};
use sync_pipeline::{db, server, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Integration registered in local profiles so the pipeline can run without
/// external connectors.
const DEMO_INTEGRATION: &str = "demo";

fn build_registry(config: &AppConfig) -> Registry {
    let mut registry = Registry::new();
    for analyzer in default_analyzers(config.analyzer.stale_identity_days) {
        registry.register_analyzer(analyzer);
    }

    if matches!(config.profile.as_str(), "local" | "dev" | "test") {
        registry.register_integration(
            IntegrationMetadata::new(DEMO_INTEGRATION, "Demo", ALL_ENTITY_TYPES.to_vec()),
            Arc::new(InMemoryConnector::new(100)),
            Arc::new(FieldMapNormalizer::new()),
        );
        registry.register_linker(DEMO_INTEGRATION, Arc::new(KeyMatchLinker::firewall_license()));
        registry.register_linker(DEMO_INTEGRATION, Arc::new(KeyMatchLinker::company_endpoint()));
    }
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(ConfigLoader::new().load()?);
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        debug!(config = %redacted_json, "Configuration");
    }

    let db = db::init_pool(&config).await?;
    db::migrate(&db).await?;

    let shutdown = CancellationToken::new();
    let bus = Arc::new(MemoryEventBus::with_dead_letter_sink(
        config.worker.clone(),
        shutdown.clone(),
        Arc::new(FailedEventRepository::new(db.clone())),
    ));
    let ctx = PipelineContext::new(
        config.clone(),
        db.clone(),
        bus,
        Arc::new(build_registry(&config)),
        Arc::new(TracingAlertSink),
    );
    ctx.subscribe_stages().await?;

    let scheduler = tokio::spawn(JobScheduler::new(ctx.clone()).run(shutdown.clone()));
    let planner = tokio::spawn(SyncPlanner::new(ctx.clone()).run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let served = server::run_server(config, db, shutdown.clone()).await;
    shutdown.cancel();

    for (name, handle) in [("scheduler", scheduler), ("planner", planner)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(task = name, error = %err, "Background task failed"),
            Err(err) => error!(task = name, error = %err, "Background task panicked"),
        }
    }

    served
}
