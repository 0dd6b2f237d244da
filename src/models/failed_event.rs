//! FailedEvent entity model
//!
//! An event a stage handler gave up on, with the error of its last attempt.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "failed_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub data_source_id: Uuid,
    pub integration_id: String,
    pub entity_type: String,
    pub stage: String,
    /// Name of the handler that gave up, e.g. `processor`
    pub handler: String,
    pub topic: String,
    pub sync_id: Option<Uuid>,
    pub batch_number: Option<i32>,
    /// The full envelope, so the event can be replayed
    #[sea_orm(column_type = "JsonBinary")]
    pub event: JsonValue,
    pub error: String,
    pub attempts: i32,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
