//! Integration metadata types
//!
//! Describes what an integration type can sync.

use serde::{Deserialize, Serialize};

use crate::normalization::EntityType;

/// Metadata about an integration type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationMetadata {
    /// Unique identifier for the integration type, e.g. `acme-rmm`
    pub integration_type: String,
    pub display_name: String,
    /// Entity types the connector can page through
    pub entity_types: Vec<EntityType>,
}

impl IntegrationMetadata {
    pub fn new(
        integration_type: impl Into<String>,
        display_name: impl Into<String>,
        entity_types: Vec<EntityType>,
    ) -> Self {
        Self {
            integration_type: integration_type.into(),
            display_name: display_name.into(),
            entity_types,
        }
    }

    pub fn supports(&self, entity_type: EntityType) -> bool {
        self.entity_types.contains(&entity_type)
    }
}
