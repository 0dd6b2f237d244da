//! # Job Scheduler
//!
//! Polls the job store on a fixed interval, atomically claims due jobs and
//! dispatches each as one `<integrationId>.sync.<entityType>` event. The
//! adapter picks the job up from there; the scheduler never fetches data.
//!
//! Claimed jobs that stay `running` past the configured lease (process crash
//! between claim and completion) are failed back into the retry path.

use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{EventEnvelope, Stage, SyncRequest};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::models::scheduled_job;
use crate::normalization::parse_sync_action;

pub mod cadence;

pub use cadence::SyncPlanner;

/// Outcome of one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub claimed: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub leases_expired: u64,
}

pub struct JobScheduler {
    ctx: PipelineContext,
}

impl JobScheduler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Poll until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!("Starting job scheduler");
        let interval = self.ctx.config.scheduler.poll_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job scheduler shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    let started = Instant::now();
                    if let Err(err) = self.poll_jobs(Utc::now()).await {
                        error!(error = %err, "Job poll failed");
                    }
                    histogram!("pipeline_scheduler_poll_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job scheduler stopped");
        Ok(())
    }

    /// Claim every due job (up to the claim batch size) and dispatch it.
    pub async fn poll_jobs(&self, now: DateTime<Utc>) -> Result<PollStats, PipelineError> {
        let mut stats = PollStats::default();

        for job in self.ctx.jobs.expired_leases(now).await? {
            warn!(job_id = %job.id, action = %job.action, "Running lease expired");
            self.ctx
                .jobs
                .fail_job(&job, &PipelineError::LeaseExpired(job.id))
                .await?;
            stats.leases_expired += 1;
        }

        let limit = self.ctx.config.scheduler.claim_batch_size;
        let claimed = self.ctx.jobs.claim_due(now, limit).await?;
        stats.claimed = claimed.len() as u64;
        gauge!("pipeline_scheduler_claimed_jobs").set(stats.claimed as f64);

        for job in claimed {
            match self.process_job(&job).await {
                Ok(()) => stats.dispatched += 1,
                Err(err) => {
                    stats.failed += 1;
                    error!(
                        job_id = %job.id,
                        action = %job.action,
                        error = %err,
                        "Failed to dispatch job"
                    );
                    self.ctx.jobs.fail_job(&job, &err).await?;
                }
            }
        }

        if stats.claimed > 0 || stats.leases_expired > 0 {
            debug!(
                claimed = stats.claimed,
                dispatched = stats.dispatched,
                failed = stats.failed,
                leases_expired = stats.leases_expired,
                "Job poll completed"
            );
        }
        Ok(stats)
    }

    /// Publish the `sync` event for one claimed job.
    pub async fn process_job(&self, job: &scheduled_job::Model) -> Result<(), PipelineError> {
        let entity_type = parse_sync_action(&job.action)
            .ok_or_else(|| PipelineError::MalformedAction(job.action.clone()))?;

        let data_source = self
            .ctx
            .data_sources
            .find(job.data_source_id)
            .await?
            .ok_or(PipelineError::DataSourceNotFound(job.data_source_id))?;

        let request = SyncRequest {
            job_id: job.id,
            action: job.action.clone(),
        };
        let event = EventEnvelope::new(&data_source, entity_type, Stage::Sync, json!(request));
        self.ctx.bus.publish(&event.topic(), event).await?;

        counter!("pipeline_jobs_dispatched_total", "integration_type" => job.integration_type.clone())
            .increment(1);
        Ok(())
    }
}
