//! DataSource entity model
//!
//! This module contains the SeaORM entity model for the data_sources table,
//! which stores one tenant's configured instance of an integration.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_INACTIVE: &str = "inactive";

/// DataSource entity representing a tenant's integration instance
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "data_sources")]
pub struct Model {
    /// Unique identifier for the data source (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Integration instance identifier; first segment of every bus topic
    pub integration_id: String,

    /// Integration type used to resolve connector, adapter, normalizer and linker
    pub integration_type: String,

    /// Activation status (active|inactive); inactive sources are never scheduled
    pub status: String,

    /// Connector configuration including credentials
    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,

    /// Set while a multi-batch sync is in flight, cleared on the final page
    pub current_sync_id: Option<Uuid>,

    /// When the stored credentials stop being valid
    pub credential_expiration_at: Option<DateTimeWithTimeZone>,

    /// Opaque metadata: cadence state and last action stamp
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Timestamp when the data source was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the data source was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }

    /// Credentials are treated as valid when no expiration is recorded.
    pub fn credentials_expired(&self, now: DateTimeWithTimeZone) -> bool {
        self.credential_expiration_at
            .map(|expires| expires <= now)
            .unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::scheduled_job::Entity")]
    ScheduledJob,
    #[sea_orm(has_many = "super::entity::Entity")]
    EntityRecord,
}

impl Related<super::scheduled_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ScheduledJob.def()
    }
}

impl Related<super::entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EntityRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
