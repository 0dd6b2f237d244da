//! Integration registry
//!
//! Holds, per integration type, the adapter, normalizer and linkers the
//! pipeline stages resolve at run time, plus the analyzers shared across
//! integrations. Built once at startup and shared through `PipelineContext`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connectors::{Connector, IntegrationMetadata};
use crate::normalization::{EntityType, Normalizer};
use crate::pipeline::adapter::{Adapter, ConnectorAdapter};
use crate::pipeline::analyzer::Analyzer;
use crate::pipeline::linker::Linker;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no {component} registered for integration type '{integration_type}'")]
    NotRegistered {
        component: &'static str,
        integration_type: String,
    },
}

impl RegistryError {
    fn missing(component: &'static str, integration_type: &str) -> Self {
        RegistryError::NotRegistered {
            component,
            integration_type: integration_type.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
    linkers: HashMap<String, Vec<Arc<dyn Linker>>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    metadata: HashMap<String, IntegrationMetadata>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration backed by `connector`, wrapped in the generic
    /// page-fetch adapter.
    pub fn register_integration(
        &mut self,
        metadata: IntegrationMetadata,
        connector: Arc<dyn Connector>,
        normalizer: Arc<dyn Normalizer>,
    ) {
        let adapter = Arc::new(ConnectorAdapter::new(metadata.clone(), connector));
        self.register_adapter(metadata, adapter, normalizer);
    }

    /// Register an integration with a custom adapter.
    pub fn register_adapter(
        &mut self,
        metadata: IntegrationMetadata,
        adapter: Arc<dyn Adapter>,
        normalizer: Arc<dyn Normalizer>,
    ) {
        let name = metadata.integration_type.clone();
        self.adapters.insert(name.clone(), adapter);
        self.normalizers.insert(name.clone(), normalizer);
        self.metadata.insert(name, metadata);
    }

    pub fn register_linker(&mut self, integration_type: &str, linker: Arc<dyn Linker>) {
        self.linkers
            .entry(integration_type.to_string())
            .or_default()
            .push(linker);
    }

    pub fn register_analyzer(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.push(analyzer);
    }

    pub fn adapter(&self, integration_type: &str) -> Result<Arc<dyn Adapter>, RegistryError> {
        self.adapters
            .get(integration_type)
            .cloned()
            .ok_or_else(|| RegistryError::missing("adapter", integration_type))
    }

    pub fn normalizer(
        &self,
        integration_type: &str,
    ) -> Result<Arc<dyn Normalizer>, RegistryError> {
        self.normalizers
            .get(integration_type)
            .cloned()
            .ok_or_else(|| RegistryError::missing("normalizer", integration_type))
    }

    /// Linkers of an integration whose inputs include `entity_type`.
    pub fn linkers_for(&self, integration_type: &str, entity_type: EntityType) -> Vec<Arc<dyn Linker>> {
        self.linkers
            .get(integration_type)
            .map(|linkers| {
                linkers
                    .iter()
                    .filter(|l| l.input_entity_types().contains(&entity_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Analyzers triggered by a change to `entity_type` in `integration_type`.
    pub fn analyzers_for(&self, integration_type: &str, entity_type: EntityType) -> Vec<Arc<dyn Analyzer>> {
        self.analyzers
            .iter()
            .filter(|a| {
                a.integration_type()
                    .is_none_or(|only| only == integration_type)
            })
            .filter(|a| a.required_entity_types().contains(&entity_type))
            .cloned()
            .collect()
    }

    pub fn get_metadata(&self, integration_type: &str) -> Result<&IntegrationMetadata, RegistryError> {
        self.metadata
            .get(integration_type)
            .ok_or_else(|| RegistryError::missing("metadata", integration_type))
    }

    /// Get metadata for all integrations, sorted by type for stable ordering
    pub fn list_metadata(&self) -> Vec<IntegrationMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by(|a, b| a.integration_type.cmp(&b.integration_type));
        metadata
    }
}
