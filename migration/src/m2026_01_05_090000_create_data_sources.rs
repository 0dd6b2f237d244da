//! Migration to create the data_sources table.
//!
//! A data source is one tenant's configured instance of an integration. It holds
//! credentials, activation status and the in-flight sync marker.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DataSources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DataSources::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DataSources::TenantId).uuid().not_null())
                    .col(ColumnDef::new(DataSources::IntegrationId).text().not_null())
                    .col(
                        ColumnDef::new(DataSources::IntegrationType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DataSources::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(DataSources::Config).json_binary().not_null())
                    .col(ColumnDef::new(DataSources::CurrentSyncId).uuid().null())
                    .col(
                        ColumnDef::new(DataSources::CredentialExpirationAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(DataSources::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(DataSources::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DataSources::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_data_sources_tenant_integration")
                    .table(DataSources::Table)
                    .col(DataSources::TenantId)
                    .col(DataSources::IntegrationId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_data_sources_status")
                    .table(DataSources::Table)
                    .col(DataSources::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_data_sources_tenant_integration")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("idx_data_sources_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(DataSources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DataSources {
    Table,
    Id,
    TenantId,
    IntegrationId,
    IntegrationType,
    Status,
    Config,
    CurrentSyncId,
    CredentialExpirationAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}
