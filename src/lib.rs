//! # Sync Pipeline Library
//!
//! Multi-tenant entity synchronization pipeline: a job store and scheduler
//! feed an event bus whose stages fetch, normalize, link and analyze records
//! from third-party integrations.

pub mod bus;
pub mod config;
pub mod connectors;
pub mod context;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod normalization;
pub mod pipeline;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub use migration;
