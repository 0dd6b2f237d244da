//! # Sync Planner
//!
//! Background task that evaluates active data sources, applies jittered
//! intervals and enqueues one `sync.<entityType>` job per supported entity
//! type once a source is due. Cadence state is persisted under
//! `metadata.sync` so multiple instances agree on the next run.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::sea_query::{LockBehavior, LockType};
use sea_orm::{
    ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, TransactionTrait,
};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CadenceConfig;
use crate::context::PipelineContext;
use crate::db::{map_db_err, to_db_time};
use crate::error::PipelineError;
use crate::models::data_source::{self, Column as DataSourceColumn, Entity as DataSource};
use crate::repositories::JobPayload;
use crate::repositories::sync_metadata::{DataSourceSyncMetadata, MIN_SYNC_INTERVAL_SECONDS};

/// Default number of data sources evaluated per tick.
const DEFAULT_BATCH_SIZE: usize = 128;

pub struct SyncPlanner {
    ctx: PipelineContext,
    batch_size: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlanStats {
    pub sources_polled: u64,
    pub jobs_enqueued: u64,
    pub types_skipped_open: u64,
    pub skipped_not_due: u64,
    pub skipped_in_flight: u64,
    pub skipped_expired_credentials: u64,
    pub backlog_sources: u64,
    pub sources_with_errors: u64,
}

#[derive(Debug, Clone)]
struct DueComputation {
    job_due: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
    is_overdue: bool,
}

impl SyncPlanner {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!("Starting sync planner");
        let tick_interval = TokioDuration::from_secs(self.ctx.config.cadence.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync planner shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "Planner tick failed");
                    }
                    histogram!("pipeline_planner_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync planner stopped");
        Ok(())
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<PlanStats, PipelineError> {
        let mut stats = PlanStats::default();

        for data_source_id in self.load_candidate_ids().await? {
            if let Err(err) = self.process_data_source(data_source_id, now, &mut stats).await {
                stats.sources_with_errors += 1;
                error!(
                    error = %err,
                    data_source_id = %data_source_id,
                    "Failed to plan data source"
                );
            }
        }

        gauge!("pipeline_planner_backlog_gauge").set(stats.backlog_sources as f64);
        debug!(
            polled = stats.sources_polled,
            enqueued = stats.jobs_enqueued,
            skipped_open = stats.types_skipped_open,
            skipped_not_due = stats.skipped_not_due,
            skipped_in_flight = stats.skipped_in_flight,
            errors = stats.sources_with_errors,
            "Planner tick completed"
        );
        Ok(stats)
    }

    async fn load_candidate_ids(&self) -> Result<Vec<Uuid>, PipelineError> {
        let mut models = self
            .ctx
            .data_sources
            .list_active()
            .await
            .map_err(|err| map_db_err("failed to load active data sources", err))?;

        models.sort_by_key(|source| {
            let metadata = DataSourceSyncMetadata::from_metadata(source.metadata.as_ref());
            metadata
                .next_run_at
                .or(metadata.first_activated_at)
                .unwrap_or_else(|| source.created_at.with_timezone(&Utc))
        });

        Ok(models
            .into_iter()
            .take(self.batch_size)
            .map(|source| source.id)
            .collect())
    }

    async fn process_data_source(
        &self,
        data_source_id: Uuid,
        now: DateTime<Utc>,
        stats: &mut PlanStats,
    ) -> Result<(), PipelineError> {
        let cadence = &self.ctx.config.cadence;
        let txn = self.ctx.db.begin().await?;

        let Some(source) = DataSource::find()
            .filter(DataSourceColumn::Id.eq(data_source_id))
            .filter(DataSourceColumn::Status.eq(data_source::STATUS_ACTIVE))
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(());
        };

        stats.sources_polled += 1;

        let mut metadata = DataSourceSyncMetadata::from_metadata(source.metadata.as_ref());
        let mut metadata_dirty = metadata.sanitize_interval(cadence);

        if metadata.first_activated_at.is_none() {
            metadata.first_activated_at = Some(source.created_at.with_timezone(&Utc));
            metadata_dirty = true;
        }

        if source.credentials_expired(to_db_time(now)) {
            stats.skipped_expired_credentials += 1;
            warn!(data_source_id = %source.id, "Credentials expired; not scheduling");
            return self.finish(txn, &source, &metadata, metadata_dirty).await;
        }

        if source.current_sync_id.is_some() {
            stats.skipped_in_flight += 1;
            debug!(
                data_source_id = %source.id,
                current_sync_id = ?source.current_sync_id,
                "Sync in flight; not scheduling"
            );
            return self.finish(txn, &source, &metadata, metadata_dirty).await;
        }

        let base_interval = metadata.effective_interval_seconds(cadence);
        if base_interval < MIN_SYNC_INTERVAL_SECONDS {
            warn!(
                data_source_id = %source.id,
                "Base interval smaller than minimum; using planner default"
            );
        }

        let due = compute_due_times(
            &metadata,
            base_interval,
            metadata.last_action_at,
            metadata
                .first_activated_at
                .unwrap_or_else(|| source.created_at.with_timezone(&Utc)),
            now,
        );

        if now < due.job_due {
            stats.skipped_not_due += 1;
            debug!(
                data_source_id = %source.id,
                due_at = %due.job_due,
                "Data source not yet due"
            );
            return self.finish(txn, &source, &metadata, metadata_dirty).await;
        }

        let entity_types = self
            .ctx
            .registry
            .get_metadata(&source.integration_type)?
            .entity_types
            .clone();

        let jitter_seconds = sample_jitter_seconds(cadence, base_interval);
        let scheduled_at = due
            .job_due
            .checked_add_signed(Duration::seconds(jitter_seconds as i64))
            .unwrap_or(now);

        for entity_type in entity_types {
            let action = entity_type.sync_action();
            if self.ctx.jobs.has_open_job(&txn, source.id, &action).await? {
                stats.types_skipped_open += 1;
                debug!(
                    data_source_id = %source.id,
                    action = %action,
                    "Open job exists; skipping entity type"
                );
                continue;
            }

            self.ctx
                .jobs
                .enqueue(&txn, &source, &action, &JobPayload::default(), scheduled_at, None)
                .await?;
            stats.jobs_enqueued += 1;
            counter!(
                "pipeline_planner_jobs_scheduled_total",
                "integration_type" => source.integration_type.clone()
            )
            .increment(1);
        }

        if due.is_overdue {
            stats.backlog_sources += 1;
        }
        info!(
            data_source_id = %source.id,
            integration_type = %source.integration_type,
            tenant_id = %source.tenant_id,
            base_interval_seconds = base_interval,
            jitter_seconds,
            scheduled_at = %scheduled_at,
            next_run_at = %due.next_run_at,
            "Planned sync run"
        );
        histogram!("pipeline_planner_jitter_seconds").record(jitter_seconds as f64);

        metadata.next_run_at = Some(due.next_run_at);
        metadata.last_jitter_seconds = Some(jitter_seconds);
        self.finish(txn, &source, &metadata, true).await
    }

    async fn finish(
        &self,
        txn: DatabaseTransaction,
        source: &data_source::Model,
        metadata: &DataSourceSyncMetadata,
        dirty: bool,
    ) -> Result<(), PipelineError> {
        if dirty {
            self.ctx
                .data_sources
                .write_sync_metadata(&txn, source, metadata)
                .await
                .map_err(|err| map_db_err("failed to persist data source metadata", err))?;
        }
        txn.commit().await?;
        Ok(())
    }
}

fn compute_due_times(
    metadata: &DataSourceSyncMetadata,
    base_interval_seconds: u64,
    last_finished: Option<DateTime<Utc>>,
    activation_reference: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DueComputation {
    let base_interval = Duration::seconds(base_interval_seconds as i64);

    let mut next_due = metadata
        .next_run_at
        .or_else(|| last_finished.map(|finished| finished + base_interval))
        .unwrap_or(activation_reference + base_interval);

    let mut advanced = false;
    while next_due <= now {
        next_due += base_interval;
        advanced = true;
    }

    let job_due = if advanced {
        next_due - base_interval
    } else {
        next_due
    };

    let next_run_at = if advanced {
        next_due
    } else {
        next_due + base_interval
    };

    DueComputation {
        job_due,
        next_run_at,
        is_overdue: now > job_due,
    }
}

fn sample_jitter_seconds(config: &CadenceConfig, base_interval_seconds: u64) -> u64 {
    let mut rng = rand::thread_rng();
    compute_jitter_seconds(config, base_interval_seconds, &mut rng)
}

fn compute_jitter_seconds<R: Rng + ?Sized>(
    config: &CadenceConfig,
    base_interval_seconds: u64,
    rng: &mut R,
) -> u64 {
    let min = config.jitter_pct_min.max(0.0);
    let max = config.jitter_pct_max.max(min);

    if min == 0.0 && max == 0.0 {
        return 0;
    }

    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };

    (base_interval_seconds as f64 * jitter_pct).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::mock::StepRng};

    fn cadence_config() -> CadenceConfig {
        CadenceConfig {
            tick_interval_seconds: 60,
            default_interval_seconds: 900,
            jitter_pct_min: 0.0,
            jitter_pct_max: 0.2,
            max_overridden_interval_seconds: 86400,
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn jitter_respects_bounds() {
        let config = cadence_config();
        let base_interval = 900;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let jitter = compute_jitter_seconds(&config, base_interval, &mut rng);
            assert!(jitter <= (base_interval as f64 * config.jitter_pct_max).round() as u64);
        }
    }

    #[test]
    fn jitter_zero_when_bounds_zero() {
        let config = CadenceConfig {
            jitter_pct_max: 0.0,
            ..cadence_config()
        };
        let mut rng = StepRng::new(0, 1);
        assert_eq!(compute_jitter_seconds(&config, 600, &mut rng), 0);
    }

    #[test]
    fn first_run_is_one_interval_after_activation() {
        let activation = at("2026-01-01T12:00:00Z");
        let due = compute_due_times(
            &DataSourceSyncMetadata::default(),
            900,
            None,
            activation,
            activation,
        );

        assert_eq!(due.job_due, activation + Duration::seconds(900));
        assert_eq!(due.next_run_at, activation + Duration::seconds(1800));
        assert!(!due.is_overdue);
    }

    #[test]
    fn catch_up_schedules_latest_missed_slot() {
        let activation = at("2026-01-01T10:00:00Z");
        let now = activation + Duration::minutes(20);
        let due = compute_due_times(
            &DataSourceSyncMetadata::default(),
            900,
            Some(activation),
            activation,
            now,
        );

        assert_eq!(due.job_due, activation + Duration::minutes(15));
        assert_eq!(due.next_run_at, activation + Duration::minutes(30));
        assert!(due.is_overdue);
    }

    #[test]
    fn persisted_next_run_wins_over_last_action() {
        let metadata = DataSourceSyncMetadata {
            next_run_at: Some(at("2026-01-01T10:15:00Z")),
            ..Default::default()
        };
        let due = compute_due_times(
            &metadata,
            900,
            Some(at("2026-01-01T09:00:00Z")),
            at("2026-01-01T08:00:00Z"),
            at("2026-01-01T10:16:00Z"),
        );

        assert_eq!(due.job_due, at("2026-01-01T10:15:00Z"));
        assert_eq!(due.next_run_at, at("2026-01-01T10:30:00Z"));
    }
}
