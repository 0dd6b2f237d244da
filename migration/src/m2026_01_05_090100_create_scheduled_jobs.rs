//! Migration to create the scheduled_jobs table.
//!
//! Scheduled jobs are the durable work items of the pipeline. Each row is one
//! page of one sync run; status, attempts and retry timing survive restarts.

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
                    .table(ScheduledJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScheduledJobs::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(ScheduledJobs::IntegrationId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::IntegrationType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::DataSourceId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ScheduledJobs::Action).text().not_null())
                    .col(
                        ColumnDef::new(ScheduledJobs::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::AttemptsMax)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::NextRetryAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ScheduledJobs::Error).json_binary().null())
                    .col(
                        ColumnDef::new(ScheduledJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ScheduledJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_scheduled_jobs_data_source_id")
                            .from(ScheduledJobs::Table, ScheduledJobs::DataSourceId)
                            .to(DataSources::Table, DataSources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Poll path: due jobs by status, ordered by priority DESC then scheduled_at
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_status_priority_scheduled ON scheduled_jobs (status, priority DESC, scheduled_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_jobs_data_source_action_status")
                    .table(ScheduledJobs::Table)
                    .col(ScheduledJobs::DataSourceId)
                    .col(ScheduledJobs::Action)
                    .col(ScheduledJobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_jobs_tenant_status")
                    .table(ScheduledJobs::Table)
                    .col(ScheduledJobs::TenantId)
                    .col(ScheduledJobs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_scheduled_jobs_status_priority_scheduled",
            "idx_scheduled_jobs_data_source_action_status",
            "idx_scheduled_jobs_tenant_status",
        ] {
            manager
                .drop_index(Index::drop().name(name).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(ScheduledJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ScheduledJobs {
    Table,
    Id,
    TenantId,
    IntegrationId,
    IntegrationType,
    DataSourceId,
    Action,
    Payload,
    Status,
    Priority,
    Attempts,
    AttemptsMax,
    ScheduledAt,
    NextRetryAt,
    StartedAt,
    FinishedAt,
    Error,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DataSources {
    Table,
    Id,
}
