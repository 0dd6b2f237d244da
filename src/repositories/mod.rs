//! # Repository Layer
//!
//! Repositories wrap the SeaORM queries for data sources, the job store and
//! dead-lettered events.
//! Pipeline stages that own their tables (processor, sweeper, linker,
//! analyzers) query them directly.

pub mod data_source;
pub mod failed_event;
pub mod scheduled_job;
pub mod sync_metadata;

pub use data_source::{DataSourceRepository, NewDataSource};
pub use failed_event::{FailedEventFilter, FailedEventRepository};
pub use scheduled_job::{FailureOutcome, JobFilter, JobPayload, ScheduledJobRepository};
pub use sync_metadata::DataSourceSyncMetadata;
