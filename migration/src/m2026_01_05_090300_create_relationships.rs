//! Migration to create the relationships table.
//!
//! Directed, typed edges between entities. Uniqueness of (parent, child, type)
//! is maintained by the linker's existence check, so no unique index is declared.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Relationships::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Relationships::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Relationships::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(Relationships::DataSourceId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationships::ParentEntityId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationships::ChildEntityId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationships::RelationshipType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Relationships::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(Relationships::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Relationships::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationships_parent_entity_id")
                            .from(Relationships::Table, Relationships::ParentEntityId)
                            .to(Entities::Table, Entities::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationships_child_entity_id")
                            .from(Relationships::Table, Relationships::ChildEntityId)
                            .to(Entities::Table, Entities::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_relationships_parent_type")
                    .table(Relationships::Table)
                    .col(Relationships::ParentEntityId)
                    .col(Relationships::RelationshipType)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_relationships_child")
                    .table(Relationships::Table)
                    .col(Relationships::ChildEntityId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_relationships_parent_type").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_relationships_child").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Relationships::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Relationships {
    Table,
    Id,
    TenantId,
    DataSourceId,
    ParentEntityId,
    ChildEntityId,
    RelationshipType,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Entities {
    Table,
    Id,
}
