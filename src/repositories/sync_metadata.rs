//! Helpers for reading and writing data source `metadata.sync` payloads.
//!
//! The cadence planner persists interval, jitter and activation markers, and
//! the job store stamps the last completed action, inside
//! `data_sources.metadata.sync`. Unknown keys elsewhere in `metadata` are
//! preserved on write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::config::CadenceConfig;

/// Minimum override interval allowed by the planner (one minute).
pub const MIN_SYNC_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataSourceSyncMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_jitter_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_activated_at: Option<DateTime<Utc>>,
    /// Action of the last job that completed, e.g. `sync.identities`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<DateTime<Utc>>,
}

impl DataSourceSyncMetadata {
    /// Parse metadata, falling back to defaults when the payload is malformed.
    pub fn from_metadata(metadata: Option<&JsonValue>) -> Self {
        let Some(metadata) = metadata else {
            return Self::default();
        };

        match metadata {
            JsonValue::Object(obj) => match obj.get("sync") {
                Some(sync_value) => serde_json::from_value::<Self>(sync_value.clone())
                    .unwrap_or_else(|_| {
                        warn!(sync_value = ?sync_value, "Failed to parse sync metadata; using defaults");
                        Self::default()
                    }),
                None => Self::default(),
            },
            other => {
                warn!(value = ?other, "Unexpected data source metadata format; expected object");
                Self::default()
            }
        }
    }

    /// Write the sync section back into `existing`, keeping every other key.
    pub fn into_metadata(&self, existing: Option<&JsonValue>) -> JsonValue {
        let mut root = match existing {
            Some(JsonValue::Object(map)) => map.clone(),
            Some(value) => {
                warn!(value = ?value, "Unexpected data source metadata structure; replacing with object");
                Map::new()
            }
            None => Map::new(),
        };

        if self.is_empty() {
            root.remove("sync");
        } else {
            let sync_value = serde_json::to_value(self).unwrap_or(JsonValue::Object(Map::new()));
            root.insert("sync".to_string(), sync_value);
        }

        JsonValue::Object(root)
    }

    /// Drop an interval override outside planner bounds.
    ///
    /// Returns `true` if the metadata was modified.
    pub fn sanitize_interval(&mut self, cadence: &CadenceConfig) -> bool {
        if let Some(value) = self.interval_seconds
            && (value < MIN_SYNC_INTERVAL_SECONDS
                || value > cadence.max_overridden_interval_seconds)
        {
            warn!(
                interval_seconds = value,
                max_allowed = cadence.max_overridden_interval_seconds,
                "Invalid sync interval override; reverting to default"
            );
            self.interval_seconds = None;
            return true;
        }
        false
    }

    pub fn effective_interval_seconds(&self, cadence: &CadenceConfig) -> u64 {
        self.interval_seconds
            .filter(|value| {
                *value >= MIN_SYNC_INTERVAL_SECONDS && *value <= cadence.max_overridden_interval_seconds
            })
            .unwrap_or(cadence.default_interval_seconds)
    }

    fn is_empty(&self) -> bool {
        self.interval_seconds.is_none()
            && self.next_run_at.is_none()
            && self.last_jitter_seconds.is_none()
            && self.first_activated_at.is_none()
            && self.last_action.is_none()
            && self.last_action_at.is_none()
    }
}
