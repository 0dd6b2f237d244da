//! Entity model
//!
//! This module contains the SeaORM entity model for the entities table: the
//! canonical, normalized form of one external record.

use std::collections::BTreeSet;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const STATE_NORMAL: &str = "normal";

/// One normalized external record
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "entities")]
pub struct Model {
    /// Unique identifier for the entity (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Data source the record was pulled from
    pub data_source_id: Uuid,

    /// Integration instance the record was pulled from
    pub integration_id: String,

    /// Canonical entity type (companies, endpoints, identities, ...)
    pub entity_type: String,

    /// Primary key of the record in the source system
    pub external_id: String,

    /// Hex SHA-256 of the canonical normalized payload
    pub data_hash: String,

    /// Record as returned by the connector
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_data: JsonValue,

    /// Record after normalization
    #[sea_orm(column_type = "JsonBinary")]
    pub normalized_data: JsonValue,

    /// Health marker maintained by analyzers
    pub state: String,

    /// Tag set stored as a sorted JSON string array
    #[sea_orm(column_type = "JsonBinary")]
    pub tags: JsonValue,

    /// Last time a sync run observed this record
    pub last_seen_at: DateTimeWithTimeZone,

    /// Sync run that last observed this record
    pub sync_id: Option<Uuid>,

    /// Soft-delete marker set by the sweeper
    pub deleted_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the entity was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the entity was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn tag_set(&self) -> BTreeSet<String> {
        tags_from_json(&self.tags)
    }

    /// Reads a field from the normalized payload.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.normalized_data.get(name)
    }
}

/// Parses a JSON string array into a tag set, ignoring non-string members.
pub fn tags_from_json(value: &JsonValue) -> BTreeSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn tags_to_json(tags: &BTreeSet<String>) -> JsonValue {
    JsonValue::Array(tags.iter().cloned().map(JsonValue::String).collect())
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
