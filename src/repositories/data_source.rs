//! DataSource repository
//!
//! Reads data sources and performs the narrow writes the pipeline makes to
//! them: the in-flight sync marker and the `metadata.sync` section.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::to_db_time;
use crate::models::data_source::{self, Column, Entity as DataSource};
use crate::repositories::sync_metadata::DataSourceSyncMetadata;

/// Fields required to register a data source.
#[derive(Debug, Clone)]
pub struct NewDataSource {
    pub tenant_id: Uuid,
    pub integration_id: String,
    pub integration_type: String,
    pub config: JsonValue,
    pub credential_expiration_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DataSourceRepository {
    db: DatabaseConnection,
}

impl DataSourceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewDataSource) -> Result<data_source::Model, DbErr> {
        let now = to_db_time(Utc::now());
        data_source::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(new.tenant_id),
            integration_id: Set(new.integration_id),
            integration_type: Set(new.integration_type),
            status: Set(data_source::STATUS_ACTIVE.to_string()),
            config: Set(new.config),
            current_sync_id: Set(None),
            credential_expiration_at: Set(new.credential_expiration_at.map(to_db_time)),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<data_source::Model>, DbErr> {
        DataSource::find_by_id(id).one(&self.db).await
    }

    pub async fn list_active(&self) -> Result<Vec<data_source::Model>, DbErr> {
        DataSource::find()
            .filter(Column::Status.eq(data_source::STATUS_ACTIVE))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    pub async fn set_status(&self, id: Uuid, status: &str) -> Result<(), DbErr> {
        DataSource::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Mark `sync_id` as the run in flight.
    pub async fn set_current_sync(&self, id: Uuid, sync_id: Uuid) -> Result<(), DbErr> {
        DataSource::update_many()
            .col_expr(Column::CurrentSyncId, Expr::value(sync_id))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Clear the in-flight marker, but only if it still names `sync_id`; a
    /// newer run for another entity type keeps its marker.
    pub async fn clear_current_sync(&self, id: Uuid, sync_id: Uuid) -> Result<bool, DbErr> {
        let result = DataSource::update_many()
            .col_expr(Column::CurrentSyncId, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .filter(Column::CurrentSyncId.eq(sync_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Record the last completed action under `metadata.sync`.
    pub async fn stamp_last_action(
        &self,
        id: Uuid,
        action: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let Some(current) = self.find(id).await? else {
            return Ok(());
        };
        let mut sync = DataSourceSyncMetadata::from_metadata(current.metadata.as_ref());
        sync.last_action = Some(action.to_string());
        sync.last_action_at = Some(at);
        self.write_sync_metadata(&self.db, &current, &sync).await
    }

    pub async fn write_sync_metadata<C: ConnectionTrait>(
        &self,
        conn: &C,
        current: &data_source::Model,
        sync: &DataSourceSyncMetadata,
    ) -> Result<(), DbErr> {
        let metadata = sync.into_metadata(current.metadata.as_ref());
        DataSource::update_many()
            .col_expr(Column::Metadata, Expr::value(Some(metadata)))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(current.id))
            .exec(conn)
            .await?;
        Ok(())
    }
}
