//! Event bus
//!
//! Topic pub/sub connecting the pipeline stages. Delivery is at-least-once:
//! a handler error is redelivered with backoff up to a bounded number of
//! attempts, after which the event is parked on a dead-letter list and handed
//! to the [`DeadLetterSink`], if one is attached.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::PipelineError;

pub mod envelope;
pub mod memory;
pub mod topic;

pub use envelope::{
    EventEnvelope, FetchedPayload, LinkedPayload, ProcessMetrics, ProcessedPayload, SkippedRecord,
    Stage, SyncMetadata, SyncRequest,
};
pub use memory::{DeadLetter, MemoryEventBus};
pub use topic::{build_topic, parse_topic, stage_pattern, topic_matches};

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("invalid topic '{0}', expected <integrationId>.<stage>.<entityType>")]
    InvalidTopic(String),
    #[error("invalid subscription pattern '{0}'")]
    InvalidPattern(String),
    #[error("event bus is shut down")]
    Closed,
}

/// A stage worker attached to a topic pattern.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: EventEnvelope) -> Result<(), PipelineError>;
}

/// Durable home for events no handler could process.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `event` on `topic`. Every subscription whose pattern matches
    /// receives it at least once.
    async fn publish(&self, topic: &str, event: EventEnvelope) -> Result<(), BusError>;

    /// Attach `handler` to every topic matching `pattern`.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Uuid, BusError>;
}
