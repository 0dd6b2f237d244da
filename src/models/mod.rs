//! # Data Models
//!
//! SeaORM entity models for every table the pipeline owns.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod data_source;
pub mod entity;
pub mod failed_event;
pub mod relationship;
pub mod scheduled_job;
pub mod sync_batch;

pub use data_source::Entity as DataSource;
pub use entity::Entity as EntityRecord;
pub use failed_event::Entity as FailedEvent;
pub use relationship::Entity as Relationship;
pub use scheduled_job::Entity as ScheduledJob;
pub use sync_batch::Entity as SyncBatch;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "sync-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
