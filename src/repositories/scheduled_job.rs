//! # ScheduledJob Repository
//!
//! The job store: durable queue of sync work and the single place job status
//! transitions are written. Retry policy (fixed backoff, bounded attempts)
//! comes from [`SchedulerConfig`].
//!
//! Lifecycle: `pending → running → completed`, or
//! `running → failed → running → … → invalid` once `attempts` reaches
//! `attempts_max`. A failed job is due again once `next_retry_at` passes; it
//! is claimed directly from `failed` without a detour through `pending`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::connectors::Cursor;
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::data_source;
use crate::models::scheduled_job::{self, ActiveModel, Column, Entity as ScheduledJob, JobStatus};
use crate::repositories::data_source::DataSourceRepository;

/// Pagination state carried from one batch job to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_started_at: Option<DateTime<Utc>>,
}

impl JobPayload {
    pub fn from_json(value: &JsonValue) -> Result<Self, PipelineError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| PipelineError::InvalidPayload(format!("job payload: {err}")))
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<Uuid>,
    pub data_source_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
}

/// What `fail_job` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Job is `failed` and due again at the returned time
    RetryScheduled(DateTime<Utc>),
    /// Job is `invalid` and will not run again
    Invalid,
    /// Job was no longer `running`; nothing written
    Stale,
}

#[derive(Debug, Clone)]
pub struct ScheduledJobRepository {
    db: DatabaseConnection,
    config: SchedulerConfig,
    data_sources: DataSourceRepository,
}

impl ScheduledJobRepository {
    pub fn new(db: DatabaseConnection, config: SchedulerConfig) -> Self {
        let data_sources = DataSourceRepository::new(db.clone());
        Self {
            db,
            config,
            data_sources,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Insert a pending job for `data_source`.
    pub async fn enqueue<C: ConnectionTrait>(
        &self,
        conn: &C,
        data_source: &data_source::Model,
        action: &str,
        payload: &JobPayload,
        scheduled_at: DateTime<Utc>,
        attempts_max: Option<i32>,
    ) -> Result<scheduled_job::Model, DbErr> {
        let now = to_db_time(Utc::now());
        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(data_source.tenant_id),
            integration_id: Set(data_source.integration_id.clone()),
            integration_type: Set(data_source.integration_type.clone()),
            data_source_id: Set(data_source.id),
            action: Set(action.to_string()),
            payload: Set(payload.to_json()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            priority: Set(0),
            attempts: Set(0),
            attempts_max: Set(attempts_max.unwrap_or(self.config.default_attempts_max)),
            scheduled_at: Set(to_db_time(scheduled_at)),
            next_retry_at: Set(None),
            started_at: Set(None),
            finished_at: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        counter!("pipeline_jobs_enqueued_total").increment(1);
        debug!(
            job_id = %job.id,
            data_source_id = %job.data_source_id,
            action = %job.action,
            "Job enqueued"
        );
        Ok(job)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<scheduled_job::Model>, DbErr> {
        ScheduledJob::find_by_id(id).one(&self.db).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<scheduled_job::Model>, DbErr> {
        let mut query = ScheduledJob::find().order_by_desc(Column::CreatedAt);
        if let Some(tenant_id) = filter.tenant_id {
            query = query.filter(Column::TenantId.eq(tenant_id));
        }
        if let Some(data_source_id) = filter.data_source_id {
            query = query.filter(Column::DataSourceId.eq(data_source_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        query
            .limit(filter.limit.unwrap_or(100).min(500))
            .all(&self.db)
            .await
    }

    /// Whether `action` already has a job that may still run.
    pub async fn has_open_job<C: ConnectionTrait>(
        &self,
        conn: &C,
        data_source_id: Uuid,
        action: &str,
    ) -> Result<bool, DbErr> {
        let open = ScheduledJob::find()
            .filter(Column::DataSourceId.eq(data_source_id))
            .filter(Column::Action.eq(action))
            .filter(Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Running.as_str(),
                JobStatus::Failed.as_str(),
            ]))
            .count(conn)
            .await?;
        Ok(open > 0)
    }

    /// Atomically move up to `limit` due jobs to `running`.
    ///
    /// Due means: scheduled time reached, attempts remaining, and either
    /// pending or failed with its retry time reached. Jobs of inactive data
    /// sources are skipped. The conditional UPDATE re-checks the status, so
    /// two pollers never claim the same job.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<scheduled_job::Model>, DbErr> {
        let now_db = to_db_time(now);
        let txn = self.db.begin().await?;

        let retry_due = Condition::all()
            .add(Column::Status.eq(JobStatus::Failed.as_str()))
            .add(Column::NextRetryAt.lte(now_db));
        let ids: Vec<Uuid> = ScheduledJob::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::ScheduledAt.lte(now_db))
            .filter(Expr::col(Column::Attempts).lt(Expr::col(Column::AttemptsMax)))
            .filter(
                Condition::any()
                    .add(Column::Status.eq(JobStatus::Pending.as_str()))
                    .add(retry_due),
            )
            .filter(
                Column::DataSourceId.in_subquery(
                    Query::select()
                        .column(data_source::Column::Id)
                        .from(data_source::Entity)
                        .and_where(
                            Expr::col(data_source::Column::Status)
                                .eq(data_source::STATUS_ACTIVE),
                        )
                        .to_owned(),
                ),
            )
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::ScheduledAt)
            .limit(limit)
            .into_tuple::<Uuid>()
            .all(&txn)
            .await?;

        if ids.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        ScheduledJob::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::StartedAt, Expr::value(now_db))
            .col_expr(Column::UpdatedAt, Expr::value(now_db))
            .filter(Column::Id.is_in(ids.clone()))
            .filter(Column::Status.is_in([JobStatus::Pending.as_str(), JobStatus::Failed.as_str()]))
            .exec(&txn)
            .await?;

        let claimed = ScheduledJob::find()
            .filter(Column::Id.is_in(ids))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::StartedAt.eq(now_db))
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::ScheduledAt)
            .all(&txn)
            .await?;

        txn.commit().await?;
        Ok(claimed)
    }

    /// Jobs whose claim is older than the running lease.
    pub async fn expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<scheduled_job::Model>, DbErr> {
        let cutoff = now - ChronoDuration::seconds(self.config.running_lease_seconds as i64);
        ScheduledJob::find()
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::StartedAt.lt(to_db_time(cutoff)))
            .all(&self.db)
            .await
    }

    /// Record a failed attempt of a running job.
    ///
    /// `attempts` grows by one. Once it reaches `attempts_max`, or when the
    /// error is not retryable, the job turns `invalid`; otherwise it becomes
    /// `failed` and due again after the fixed backoff.
    pub async fn fail_job(
        &self,
        job: &scheduled_job::Model,
        error: &PipelineError,
    ) -> Result<FailureOutcome, DbErr> {
        let now = Utc::now();
        let attempts = job.attempts + 1;
        let terminal = attempts >= job.attempts_max || !error.is_retryable();
        let backoff_seconds = self.config.retry_backoff_seconds;
        let next_retry_at = now + ChronoDuration::seconds(backoff_seconds as i64);

        let error_json = json!({
            "message": error.to_string(),
            "code": error.code(),
            "kind": error.kind().as_str(),
            "attempts": attempts,
            "backoffSeconds": (!terminal).then_some(backoff_seconds),
            "timestamp": now.to_rfc3339(),
            "syncError": error.sync_error(),
        });

        let status = if terminal {
            JobStatus::Invalid
        } else {
            JobStatus::Failed
        };

        let result = ScheduledJob::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::Attempts, Expr::value(attempts))
            .col_expr(
                Column::NextRetryAt,
                Expr::value((!terminal).then(|| to_db_time(next_retry_at))),
            )
            .col_expr(
                Column::FinishedAt,
                Expr::value(terminal.then(|| to_db_time(now))),
            )
            .col_expr(Column::Error, Expr::value(Some(error_json)))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(job_id = %job.id, "Job no longer running; failure not recorded");
            return Ok(FailureOutcome::Stale);
        }

        if terminal {
            counter!("pipeline_jobs_failed_total", "outcome" => "invalid").increment(1);
            warn!(
                job_id = %job.id,
                data_source_id = %job.data_source_id,
                action = %job.action,
                attempts,
                attempts_max = job.attempts_max,
                error = %error,
                "Job marked invalid"
            );
            if let Ok(payload) = JobPayload::from_json(&job.payload)
                && let Some(sync_id) = payload.sync_id
            {
                self.data_sources
                    .clear_current_sync(job.data_source_id, sync_id)
                    .await?;
            }
            Ok(FailureOutcome::Invalid)
        } else {
            counter!("pipeline_jobs_failed_total", "outcome" => "retry").increment(1);
            info!(
                job_id = %job.id,
                action = %job.action,
                attempts,
                next_retry_at = %next_retry_at,
                error = %error,
                "Job failed; retry scheduled"
            );
            Ok(FailureOutcome::RetryScheduled(next_retry_at))
        }
    }

    /// Mark a running job completed and stamp the data source's last action.
    pub async fn complete_job(&self, job: &scheduled_job::Model) -> Result<bool, DbErr> {
        let now = Utc::now();
        let result = ScheduledJob::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(to_db_time(now)))
            .col_expr(Column::NextRetryAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::Error, Expr::value(Option::<JsonValue>::None))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(job_id = %job.id, "Job no longer running; completion not recorded");
            return Ok(false);
        }

        counter!("pipeline_jobs_completed_total").increment(1);
        self.data_sources
            .stamp_last_action(job.data_source_id, &job.action, now)
            .await?;
        Ok(true)
    }

    /// Persist the run identity generated for batch 1 so a retry of the same
    /// job resumes the same run.
    pub async fn record_sync_start(
        &self,
        job: &scheduled_job::Model,
        payload: &JobPayload,
    ) -> Result<(), DbErr> {
        ScheduledJob::update_many()
            .col_expr(Column::Payload, Expr::value(payload.to_json()))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(job.id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Complete `job` and enqueue the job for the following page in one
    /// transaction.
    pub async fn advance_batch(
        &self,
        job: &scheduled_job::Model,
        data_source: &data_source::Model,
        next: &JobPayload,
    ) -> Result<scheduled_job::Model, DbErr> {
        let txn = self.db.begin().await?;
        let next_job = self
            .enqueue(
                &txn,
                data_source,
                &job.action,
                next,
                Utc::now(),
                Some(job.attempts_max),
            )
            .await?;
        ScheduledJob::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(to_db_time(Utc::now())))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        counter!("pipeline_jobs_completed_total").increment(1);
        Ok(next_job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_in_camel_case() {
        let payload = JobPayload {
            cursor: Some(Cursor::from_string("100")),
            sync_id: Some(Uuid::nil()),
            batch_number: Some(2),
            total_processed: Some(100),
            sync_started_at: None,
        };
        let value = payload.to_json();
        assert_eq!(value["batchNumber"], 2);
        assert_eq!(value["totalProcessed"], 100);
        assert_eq!(value["cursor"], "100");
        assert!(value.get("syncStartedAt").is_none());
        assert_eq!(JobPayload::from_json(&value).unwrap(), payload);
    }

    #[test]
    fn empty_payload_means_first_batch() {
        let payload = JobPayload::from_json(&json!({})).unwrap();
        assert_eq!(payload.sync_id, None);
        assert_eq!(JobPayload::from_json(&JsonValue::Null).unwrap(), payload);
        assert!(JobPayload::from_json(&json!({"batchNumber": "two"})).is_err());
    }
}
