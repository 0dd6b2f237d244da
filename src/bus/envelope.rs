//! Event envelope and the stage payloads carried inside it.
//!
//! The envelope is the wire contract between stages: identity fields are
//! copied unchanged from stage to stage, `stage` and `payload` change, and
//! `syncMetadata` rides along from the adapter onward.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::topic::build_topic;
use crate::connectors::Cursor;
use crate::error::PipelineError;
use crate::models::data_source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sync,
    Fetched,
    Processed,
    Linked,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Sync => "sync",
            Stage::Fetched => "fetched",
            Stage::Processed => "processed",
            Stage::Linked => "linked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Stage::Sync, Stage::Fetched, Stage::Processed, Stage::Linked]
            .into_iter()
            .find(|s| s.as_str() == value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of one batch within a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub sync_id: Uuid,
    pub batch_number: i32,
    pub is_final_batch: bool,
    /// Cursor for the next page; absent on the final batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub sync_started_at: DateTime<Utc>,
    /// Records fetched so far in this run, including this batch
    #[serde(default)]
    pub total_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "eventID")]
    pub event_id: Uuid,
    #[serde(rename = "tenantID")]
    pub tenant_id: Uuid,
    #[serde(rename = "integrationID")]
    pub integration_id: String,
    pub integration_type: String,
    #[serde(rename = "dataSourceID")]
    pub data_source_id: Uuid,
    pub entity_type: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_metadata: Option<SyncMetadata>,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(
        data_source: &data_source::Model,
        entity_type: &str,
        stage: Stage,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id: data_source.tenant_id,
            integration_id: data_source.integration_id.clone(),
            integration_type: data_source.integration_type.clone(),
            data_source_id: data_source.id,
            entity_type: entity_type.to_string(),
            stage,
            created_at: Utc::now(),
            sync_metadata: None,
            payload,
        }
    }

    pub fn with_sync_metadata(mut self, metadata: SyncMetadata) -> Self {
        self.sync_metadata = Some(metadata);
        self
    }

    /// Downstream event for the same data source, entity type and run.
    pub fn next_stage(&self, stage: Stage, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            stage,
            created_at: Utc::now(),
            payload,
            ..self.clone()
        }
    }

    pub fn topic(&self) -> String {
        build_topic(&self.integration_id, self.stage, &self.entity_type)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        T::deserialize(&self.payload).map_err(|err| {
            PipelineError::InvalidPayload(format!("{} payload: {err}", self.stage))
        })
    }

    pub fn require_sync_metadata(&self) -> Result<&SyncMetadata, PipelineError> {
        self.sync_metadata.as_ref().ok_or_else(|| {
            PipelineError::InvalidPayload(format!("{} event without syncMetadata", self.stage))
        })
    }
}

/// Payload of a `sync` event: which claimed job to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub job_id: Uuid,
    pub action: String,
}

/// Payload of a `fetched` event: one page of raw connector records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedPayload {
    pub records: Vec<Value>,
    pub has_more: bool,
    /// Records fetched so far in this run, including this page
    pub total_processed: u64,
}

/// Counters reported by the processor for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub queries: usize,
    pub mutations: usize,
    pub elapsed_ms: u64,
}

/// A record the processor could not normalize; the rest of the batch proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRecord {
    /// Position in the fetched page
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub reason: String,
}

/// Payload of a `processed` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedPayload {
    /// Entities created or updated by this batch
    pub changed_entity_ids: Vec<Uuid>,
    pub metrics: ProcessMetrics,
    #[serde(default)]
    pub skipped: Vec<SkippedRecord>,
}

/// Payload of a `linked` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedPayload {
    pub changed_entity_ids: Vec<Uuid>,
    pub relationships_created: usize,
    /// Edges removed because their linker no longer derives them
    #[serde(default)]
    pub relationships_removed: usize,
}
