//! In-memory connector
//!
//! Serves records held in memory with offset cursors. Used for the built-in
//! sample integration and as the connector double in tests, where failures
//! can be queued to exercise the retry path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::connectors::{Connector, ConnectorError, Cursor, FetchPage, FetchParams};
use crate::models::data_source::Model as DataSource;
use crate::normalization::EntityType;

pub struct InMemoryConnector {
    page_size: usize,
    records: Mutex<HashMap<EntityType, Vec<Value>>>,
    queued_failures: Mutex<VecDeque<ConnectorError>>,
    persistent_failure: Mutex<Option<ConnectorError>>,
    healthy: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            records: Mutex::new(HashMap::new()),
            queued_failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            healthy: AtomicBool::new(true),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_records(mut self, entity_type: EntityType, records: Vec<Value>) -> Self {
        self.records.get_mut().insert(entity_type, records);
        self
    }

    /// Replace the records served for `entity_type`.
    pub async fn set_records(&self, entity_type: EntityType, records: Vec<Value>) {
        self.records.lock().await.insert(entity_type, records);
    }

    /// The next fetch returns `error` instead of a page.
    pub async fn fail_next(&self, error: ConnectorError) {
        self.queued_failures.lock().await.push_back(error);
    }

    /// Every fetch returns `error` until cleared with `None`.
    pub async fn fail_always(&self, error: Option<ConnectorError>) {
        *self.persistent_failure.lock().await = error;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn offset_from(cursor: Option<&Cursor>) -> Result<usize, ConnectorError> {
        let Some(cursor) = cursor else {
            return Ok(0);
        };
        let parsed = match cursor.as_json() {
            Value::String(s) => s.parse::<usize>().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| ConnectorError::MalformedResponse {
            details: format!("unrecognized cursor {}", cursor.as_json()),
        })
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn check_health(&self, _data_source: &DataSource) -> Result<bool, ConnectorError> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn fetch(&self, params: FetchParams) -> Result<FetchPage, ConnectorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.queued_failures.lock().await.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.persistent_failure.lock().await.clone() {
            return Err(error);
        }

        let offset = Self::offset_from(params.cursor.as_ref())?;
        let records = self.records.lock().await;
        let all = records
            .get(&params.entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let start = offset.min(all.len());
        let end = (start + self.page_size).min(all.len());
        let has_more = end < all.len();

        Ok(FetchPage {
            records: all[start..end].to_vec(),
            next_cursor: has_more.then(|| Cursor::from_string(end.to_string())),
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data_source;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn data_source() -> DataSource {
        let now = Utc::now().fixed_offset();
        data_source::Model {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            integration_id: "acme-1".into(),
            integration_type: "acme".into(),
            status: data_source::STATUS_ACTIVE.into(),
            config: json!({}),
            current_sync_id: None,
            credential_expiration_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn pages_through_records_with_offset_cursor() {
        let records = (0..5).map(|i| json!({"id": i})).collect();
        let connector = InMemoryConnector::new(2).with_records(EntityType::Companies, records);

        let mut cursor = None;
        let mut sizes = Vec::new();
        loop {
            let page = connector
                .fetch(FetchParams {
                    data_source: data_source(),
                    entity_type: EntityType::Companies,
                    cursor: cursor.clone(),
                })
                .await
                .unwrap();
            sizes.push(page.records.len());
            if !page.has_more {
                assert!(page.next_cursor.is_none());
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(connector.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn queued_failure_is_returned_once() {
        let connector = InMemoryConnector::new(10);
        connector
            .fail_next(ConnectorError::NetworkError {
                details: "reset".into(),
                retryable: true,
            })
            .await;

        let params = FetchParams {
            data_source: data_source(),
            entity_type: EntityType::Licenses,
            cursor: None,
        };
        assert!(connector.fetch(params.clone()).await.is_err());
        let page = connector.fetch(params).await.unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
    }
}
