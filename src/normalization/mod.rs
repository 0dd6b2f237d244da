use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Canonical registry of entity types an integration can sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Companies,
    Endpoints,
    Identities,
    Licenses,
    Firewalls,
}

impl EntityType {
    /// Return the canonical string representation for this type.
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Companies => "companies",
            EntityType::Endpoints => "endpoints",
            EntityType::Identities => "identities",
            EntityType::Licenses => "licenses",
            EntityType::Firewalls => "firewalls",
        }
    }

    /// Job action that syncs this type, e.g. `sync.identities`.
    pub fn sync_action(self) -> String {
        format!("{SYNC_ACTION_PREFIX}{}", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete registry of canonical entity types.
pub const ALL_ENTITY_TYPES: &[EntityType] = &[
    EntityType::Companies,
    EntityType::Endpoints,
    EntityType::Identities,
    EntityType::Licenses,
    EntityType::Firewalls,
];

pub const SYNC_ACTION_PREFIX: &str = "sync.";

/// Return the canonical entity type corresponding to the provided string, if any.
pub fn parse_entity_type(value: &str) -> Option<EntityType> {
    ALL_ENTITY_TYPES
        .iter()
        .copied()
        .find(|t| t.as_str() == value)
}

/// Extracts the entity type segment from a `sync.<entityType>` action.
///
/// The segment is returned verbatim so callers can report unsupported types
/// by name; `None` means the action is not a sync action at all.
pub fn parse_sync_action(action: &str) -> Option<&str> {
    action
        .strip_prefix(SYNC_ACTION_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.contains('.'))
}

/// A raw record after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Primary key of the record in the source system
    pub external_id: String,
    /// Canonical payload; hashed for change detection
    pub normalized: Value,
}

/// Errors that can occur while mapping connector records to canonical entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record missing required field: {field}")]
    MissingField { field: String },
    #[error("field {field} has an unsupported value")]
    InvalidField { field: String },
}

/// Maps one raw connector record into its canonical form.
pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        entity_type: EntityType,
        raw: &Value,
    ) -> Result<NormalizedRecord, NormalizationError>;
}

/// Normalizer driven by a per-type id field and a field rename table.
///
/// Null fields are dropped, renamed keys win over their source names, and
/// `externalId` is always present in the output.
#[derive(Debug, Clone, Default)]
pub struct FieldMapNormalizer {
    id_fields: HashMap<EntityType, String>,
    renames: HashMap<EntityType, HashMap<String, String>>,
}

impl FieldMapNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_field(mut self, entity_type: EntityType, field: impl Into<String>) -> Self {
        self.id_fields.insert(entity_type, field.into());
        self
    }

    pub fn with_rename(
        mut self,
        entity_type: EntityType,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.renames
            .entry(entity_type)
            .or_default()
            .insert(from.into(), to.into());
        self
    }

    fn id_field(&self, entity_type: EntityType) -> &str {
        self.id_fields
            .get(&entity_type)
            .map(String::as_str)
            .unwrap_or("id")
    }
}

impl Normalizer for FieldMapNormalizer {
    fn normalize(
        &self,
        entity_type: EntityType,
        raw: &Value,
    ) -> Result<NormalizedRecord, NormalizationError> {
        let object = raw.as_object().ok_or(NormalizationError::NotAnObject)?;
        let id_field = self.id_field(entity_type);

        let external_id = match object.get(id_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            None | Some(Value::Null) => {
                return Err(NormalizationError::MissingField {
                    field: id_field.to_string(),
                });
            }
            Some(_) => {
                return Err(NormalizationError::InvalidField {
                    field: id_field.to_string(),
                });
            }
        };

        let renames = self.renames.get(&entity_type);
        let mut normalized = Map::new();
        for (key, value) in object {
            if value.is_null() {
                continue;
            }
            let target = renames
                .and_then(|r| r.get(key))
                .cloned()
                .unwrap_or_else(|| key.clone());
            normalized.insert(target, value.clone());
        }
        normalized.insert("externalId".to_string(), Value::String(external_id.clone()));

        Ok(NormalizedRecord {
            external_id,
            normalized: Value::Object(normalized),
        })
    }
}

/// Serializes `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                let mut out = Map::new();
                for (k, v) in ordered {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Hex SHA-256 of the canonical serialization; equal content means equal hash
/// regardless of key order.
pub fn content_hash(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn registry_has_unique_entries() {
        let mut seen = HashSet::new();
        for entity_type in ALL_ENTITY_TYPES {
            assert!(seen.insert(entity_type.as_str()), "duplicate type {}", entity_type);
        }
    }

    #[test]
    fn sync_actions_parse_back_to_their_type() {
        for entity_type in ALL_ENTITY_TYPES {
            let action = entity_type.sync_action();
            let segment = parse_sync_action(&action).expect("action should parse");
            assert_eq!(parse_entity_type(segment), Some(*entity_type));
        }
        assert_eq!(parse_sync_action("sync."), None);
        assert_eq!(parse_sync_action("refresh.identities"), None);
        assert_eq!(parse_sync_action("sync.printers"), Some("printers"));
    }

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});
        let b = json!({"a": {"x": "v", "y": [1, 2]}, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"b": 2})));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn field_map_normalizer_renames_and_drops_nulls() {
        let normalizer = FieldMapNormalizer::new()
            .with_id_field(EntityType::Firewalls, "deviceId")
            .with_rename(EntityType::Firewalls, "serial_no", "serial");

        let record = normalizer
            .normalize(
                EntityType::Firewalls,
                &json!({"deviceId": 42, "serial_no": "SN-1", "note": null}),
            )
            .unwrap();

        assert_eq!(record.external_id, "42");
        assert_eq!(
            record.normalized,
            json!({"deviceId": 42, "serial": "SN-1", "externalId": "42"})
        );
    }

    #[test]
    fn field_map_normalizer_rejects_bad_records() {
        let normalizer = FieldMapNormalizer::new();
        assert_eq!(
            normalizer.normalize(EntityType::Companies, &json!("nope")),
            Err(NormalizationError::NotAnObject)
        );
        assert_eq!(
            normalizer.normalize(EntityType::Companies, &json!({"name": "x"})),
            Err(NormalizationError::MissingField { field: "id".into() })
        );
        assert_eq!(
            normalizer.normalize(EntityType::Companies, &json!({"id": true})),
            Err(NormalizationError::InvalidField { field: "id".into() })
        );
    }
}
