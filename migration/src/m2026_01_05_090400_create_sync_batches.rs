//! Migration to create the sync_batches table.
//!
//! One row per processed batch of a sync run. The sweeper uses it to tell when
//! every batch of a run has been processed, independent of arrival order.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncBatches::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncBatches::SyncId).uuid().not_null())
                    .col(ColumnDef::new(SyncBatches::BatchNumber).integer().not_null())
                    .col(ColumnDef::new(SyncBatches::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(SyncBatches::EntityType).text().not_null())
                    .col(
                        ColumnDef::new(SyncBatches::IsFinal)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::RecordCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::SyncStartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::ProcessedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(SyncBatches::SyncId)
                            .col(SyncBatches::BatchNumber),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_batches_data_source_id")
                            .from(SyncBatches::Table, SyncBatches::DataSourceId)
                            .to(DataSources::Table, DataSources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncBatches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncBatches {
    Table,
    SyncId,
    BatchNumber,
    DataSourceId,
    EntityType,
    IsFinal,
    RecordCount,
    SyncStartedAt,
    ProcessedAt,
}

#[derive(DeriveIden)]
enum DataSources {
    Table,
    Id,
}
