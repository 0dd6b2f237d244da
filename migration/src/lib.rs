//! Database migrations for the sync pipeline.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_data_sources;
mod m2026_01_05_090100_create_scheduled_jobs;
mod m2026_01_05_090200_create_entities;
mod m2026_01_05_090300_create_relationships;
mod m2026_01_05_090400_create_sync_batches;
mod m2026_01_05_090500_create_failed_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_data_sources::Migration),
            Box::new(m2026_01_05_090100_create_scheduled_jobs::Migration),
            Box::new(m2026_01_05_090200_create_entities::Migration),
            Box::new(m2026_01_05_090300_create_relationships::Migration),
            Box::new(m2026_01_05_090400_create_sync_batches::Migration),
            Box::new(m2026_01_05_090500_create_failed_events::Migration),
        ]
    }
}
