//! Connectors module
//!
//! - The `Connector` trait every external system client implements
//! - Integration metadata and the registry resolving per-integration components
//! - The in-memory connector backing the sample integration

pub mod memory;
pub mod metadata;
pub mod registry;
pub mod trait_;

pub use memory::InMemoryConnector;
pub use metadata::IntegrationMetadata;
pub use registry::{Registry, RegistryError};
pub use trait_::{
    Connector, ConnectorError, Cursor, FetchPage, FetchParams, SyncError, SyncErrorKind,
};
