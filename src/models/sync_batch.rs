//! SyncBatch entity model
//!
//! Ledger of processed batches per sync run, used to decide when a run is
//! complete enough to sweep.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub sync_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub batch_number: i32,
    pub data_source_id: Uuid,
    pub entity_type: String,
    /// True for the batch the adapter emitted with `isFinalBatch`
    pub is_final: bool,
    pub record_count: i32,
    /// Start of the run; the sweep cutoff for `last_seen_at`
    pub sync_started_at: DateTimeWithTimeZone,
    pub processed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
