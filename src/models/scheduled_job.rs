//! ScheduledJob entity model
//!
//! This module contains the SeaORM entity model for the scheduled_jobs table,
//! the durable queue of sync work. One row is one page of one sync run.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lifecycle of a scheduled job.
///
/// `pending → running → completed`, or `running → failed → running …` until
/// attempts reach `attempts_max`, at which point the job becomes `invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Invalid,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ALL_JOB_STATUSES.iter().copied().find(|s| s.as_str() == value)
    }

    /// Terminal statuses are never picked up by the poller again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Invalid)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ALL_JOB_STATUSES: &[JobStatus] = &[
    JobStatus::Pending,
    JobStatus::Running,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Invalid,
];

/// ScheduledJob entity representing one dispatchable unit of sync work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Integration instance the job targets
    pub integration_id: String,

    /// Integration type of the owning data source
    pub integration_type: String,

    /// Data source this job syncs
    pub data_source_id: Uuid,

    /// Action in the form `sync.<entityType>`
    pub action: String,

    /// Pagination state: cursor, syncId, batchNumber, totalProcessed, syncStartedAt
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Current status (pending|running|completed|failed|invalid)
    pub status: String,

    /// Job priority for scheduling (higher values = higher priority)
    pub priority: i16,

    /// Number of failed attempts recorded for this job
    pub attempts: i32,

    /// Failed attempts allowed before the job turns invalid
    pub attempts_max: i32,

    /// Timestamp when the job becomes eligible to run
    pub scheduled_at: DateTimeWithTimeZone,

    /// Earliest time a failed job may be picked up again
    pub next_retry_at: Option<DateTimeWithTimeZone>,

    /// Timestamp of the most recent claim
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached completed or invalid
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Structured error details of the last failure
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    /// Timestamp when the job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::data_source::Entity",
        from = "Column::DataSourceId",
        to = "super::data_source::Column::Id"
    )]
    DataSource,
}

impl Related<super::data_source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSource.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in ALL_JOB_STATUSES {
            assert_eq!(JobStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(JobStatus::parse("queued"), None);
    }

    #[test]
    fn only_completed_and_invalid_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Invalid.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
