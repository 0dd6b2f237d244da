//! Migration to create the entities table.
//!
//! Entities are the canonical, normalized form of external records. The natural
//! key (data_source_id, entity_type, external_id) is unique among live rows only,
//! so soft-deleted history never blocks a record from reappearing.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entities::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Entities::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Entities::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Entities::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(Entities::IntegrationId).text().not_null())
                    .col(ColumnDef::new(Entities::EntityType).text().not_null())
                    .col(ColumnDef::new(Entities::ExternalId).text().not_null())
                    .col(ColumnDef::new(Entities::DataHash).text().not_null())
                    .col(ColumnDef::new(Entities::RawData).json_binary().not_null())
                    .col(
                        ColumnDef::new(Entities::NormalizedData)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Entities::State)
                            .text()
                            .not_null()
                            .default("normal"),
                    )
                    .col(ColumnDef::new(Entities::Tags).json_binary().not_null())
                    .col(
                        ColumnDef::new(Entities::LastSeenAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Entities::SyncId).uuid().null())
                    .col(
                        ColumnDef::new(Entities::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Entities::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Entities::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_entities_data_source_id")
                            .from(Entities::Table, Entities::DataSourceId)
                            .to(DataSources::Table, DataSources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Partial unique index: Postgres and SQLite both accept the WHERE clause
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_entities_live_natural_key ON entities (data_source_id, entity_type, external_id) WHERE deleted_at IS NULL".to_string(),
            ))
            .await?;

        // Sweep path: stale rows of one (data source, type)
        manager
            .create_index(
                Index::create()
                    .name("idx_entities_data_source_type_sync")
                    .table(Entities::Table)
                    .col(Entities::DataSourceId)
                    .col(Entities::EntityType)
                    .col(Entities::SyncId)
                    .col(Entities::LastSeenAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_entities_tenant_type")
                    .table(Entities::Table)
                    .col(Entities::TenantId)
                    .col(Entities::EntityType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "uq_entities_live_natural_key",
            "idx_entities_data_source_type_sync",
            "idx_entities_tenant_type",
        ] {
            manager
                .drop_index(Index::drop().name(name).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Entities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Entities {
    Table,
    Id,
    TenantId,
    DataSourceId,
    IntegrationId,
    EntityType,
    ExternalId,
    DataHash,
    RawData,
    NormalizedData,
    State,
    Tags,
    LastSeenAt,
    SyncId,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DataSources {
    Table,
    Id,
}
