//! Relationship entity model
//!
//! Directed, typed edge between two entities derived by a linker.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "relationships")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub data_source_id: Uuid,
    pub parent_entity_id: Uuid,
    pub child_entity_id: Uuid,
    /// e.g. `firewall_license`, `company_endpoint`
    pub relationship_type: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::entity::Entity",
        from = "Column::ParentEntityId",
        to = "super::entity::Column::Id"
    )]
    Parent,
    #[sea_orm(
        belongs_to = "super::entity::Entity",
        from = "Column::ChildEntityId",
        to = "super::entity::Column::Id"
    )]
    Child,
}

impl ActiveModelBehavior for ActiveModel {}
