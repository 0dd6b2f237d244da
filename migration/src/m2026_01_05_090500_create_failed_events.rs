//! Migration to create the failed_events table.
//!
//! Durable record of events a stage handler could not process within its
//! delivery budget, keyed back to the sync run and batch they belonged to.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FailedEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FailedEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FailedEvents::EventId).uuid().not_null())
                    .col(ColumnDef::new(FailedEvents::TenantId).uuid().not_null())
                    .col(ColumnDef::new(FailedEvents::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(FailedEvents::IntegrationId).text().not_null())
                    .col(ColumnDef::new(FailedEvents::EntityType).text().not_null())
                    .col(ColumnDef::new(FailedEvents::Stage).text().not_null())
                    .col(ColumnDef::new(FailedEvents::Handler).text().not_null())
                    .col(ColumnDef::new(FailedEvents::Topic).text().not_null())
                    .col(ColumnDef::new(FailedEvents::SyncId).uuid().null())
                    .col(ColumnDef::new(FailedEvents::BatchNumber).integer().null())
                    .col(ColumnDef::new(FailedEvents::Event).json_binary().not_null())
                    .col(ColumnDef::new(FailedEvents::Error).text().not_null())
                    .col(
                        ColumnDef::new(FailedEvents::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(FailedEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_failed_events_data_source_id")
                            .from(FailedEvents::Table, FailedEvents::DataSourceId)
                            .to(DataSources::Table, DataSources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_failed_events_data_source_created")
                    .table(FailedEvents::Table)
                    .col(FailedEvents::DataSourceId)
                    .col(FailedEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_failed_events_sync_batch")
                    .table(FailedEvents::Table)
                    .col(FailedEvents::SyncId)
                    .col(FailedEvents::BatchNumber)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FailedEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FailedEvents {
    Table,
    Id,
    EventId,
    TenantId,
    DataSourceId,
    IntegrationId,
    EntityType,
    Stage,
    Handler,
    Topic,
    SyncId,
    BatchNumber,
    Event,
    Error,
    Attempts,
    CreatedAt,
}

#[derive(DeriveIden)]
enum DataSources {
    Table,
    Id,
}
