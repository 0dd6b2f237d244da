//! In-process event bus.
//!
//! Each subscription owns a bounded channel and a worker task. The worker
//! runs deliveries concurrently up to `worker.concurrency`, redelivers
//! retryable failures with doubling backoff, and dead-letters the event once
//! `worker.delivery_attempts` is exhausted. Dead letters are kept in memory
//! and passed to the attached [`DeadLetterSink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, mpsc};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::topic::{topic_matches, validate_pattern, validate_topic};
use super::{BusError, DeadLetterSink, EventBus, EventEnvelope, EventHandler};
use crate::config::WorkerConfig;
use crate::telemetry::{TraceContext, with_trace_context};

/// An event a handler could not process within the delivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subscription_id: Uuid,
    pub handler: &'static str,
    pub topic: String,
    pub event: EventEnvelope,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

struct Delivery {
    topic: String,
    event: EventEnvelope,
}

struct Subscription {
    id: Uuid,
    pattern: String,
    sender: mpsc::Sender<Delivery>,
}

struct Inner {
    config: WorkerConfig,
    subscriptions: RwLock<Vec<Subscription>>,
    published: Mutex<Vec<(String, EventEnvelope)>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct MemoryEventBus {
    inner: Arc<Inner>,
}

/// Decrements the in-flight count even if the handler panics.
struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

impl Inner {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn deliver(
        &self,
        subscription_id: Uuid,
        handler: &dyn EventHandler,
        delivery: Delivery,
    ) {
        let Delivery { topic, event } = delivery;
        let max_attempts = self.config.delivery_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.redelivery_backoff_ms);
        let trace = TraceContext::for_event(event.event_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = with_trace_context(trace.clone(), handler.handle(event.clone())).await;
            histogram!("pipeline_handler_duration_ms", "handler" => handler.name())
                .record(started.elapsed().as_secs_f64() * 1000.0);

            let err = match result {
                Ok(()) => {
                    counter!("pipeline_events_delivered_total", "handler" => handler.name())
                        .increment(1);
                    return;
                }
                Err(err) => err,
            };

            if attempt < max_attempts && err.is_retryable() && !self.shutdown.is_cancelled() {
                warn!(
                    handler = handler.name(),
                    topic = %topic,
                    event_id = %event.event_id,
                    attempt,
                    error = %err,
                    "Handler failed, redelivering"
                );
                counter!("pipeline_events_redelivered_total", "handler" => handler.name())
                    .increment(1);
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
                continue;
            }

            error!(
                handler = handler.name(),
                topic = %topic,
                event_id = %event.event_id,
                attempts = attempt,
                error = %err,
                "Handler failed, dead-lettering event"
            );
            counter!("pipeline_events_dead_lettered_total", "handler" => handler.name())
                .increment(1);
            let letter = DeadLetter {
                subscription_id,
                handler: handler.name(),
                topic,
                event,
                error: err.to_string(),
                attempts: attempt,
                failed_at: Utc::now(),
            };
            if let Some(sink) = &self.dead_letter_sink {
                if let Err(sink_err) = sink.record(&letter).await {
                    error!(
                        handler = handler.name(),
                        event_id = %letter.event.event_id,
                        error = %sink_err,
                        "Failed to persist dead letter"
                    );
                    counter!("pipeline_dead_letter_persist_errors_total").increment(1);
                }
            }
            self.dead_letters.lock().await.push(letter);
            return;
        }
    }
}

impl MemoryEventBus {
    pub fn new(config: WorkerConfig, shutdown: CancellationToken) -> Self {
        Self::build(config, shutdown, None)
    }

    /// Bus whose dead letters are also written to `sink`.
    pub fn with_dead_letter_sink(
        config: WorkerConfig,
        shutdown: CancellationToken,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self::build(config, shutdown, Some(sink))
    }

    fn build(
        config: WorkerConfig,
        shutdown: CancellationToken,
        dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                subscriptions: RwLock::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                dead_letters: Mutex::new(Vec::new()),
                dead_letter_sink,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Every event published so far, in publish order.
    pub async fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.inner.published.lock().await.clone()
    }

    /// Published events whose topic matches `pattern`.
    pub async fn published_matching(&self, pattern: &str) -> Vec<EventEnvelope> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|(topic, _)| topic_matches(pattern, topic))
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }

    /// Resolves once no delivery is queued or running, including deliveries
    /// triggered by events the handlers themselves published.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn run_worker(
        inner: Arc<Inner>,
        subscription_id: Uuid,
        mut receiver: mpsc::Receiver<Delivery>,
        handler: Arc<dyn EventHandler>,
    ) {
        let semaphore = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
        loop {
            let delivery = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                inner.finish_one();
                break;
            };
            let inner = inner.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = InFlightGuard(inner.clone());
                inner
                    .deliver(subscription_id, handler.as_ref(), delivery)
                    .await;
            });
        }

        // Release anything still queued so waiters are not left hanging.
        receiver.close();
        while receiver.try_recv().is_ok() {
            inner.finish_one();
        }
        debug!(handler = handler.name(), "Subscription worker stopped");
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, event: EventEnvelope) -> Result<(), BusError> {
        validate_topic(topic)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        counter!("pipeline_events_published_total", "stage" => event.stage.as_str())
            .increment(1);
        self.inner
            .published
            .lock()
            .await
            .push((topic.to_string(), event.clone()));

        let targets: Vec<mpsc::Sender<Delivery>> = self
            .inner
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| s.sender.clone())
            .collect();

        if targets.is_empty() {
            debug!(topic, event_id = %event.event_id, "No subscribers for topic");
        }

        for sender in targets {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                topic: topic.to_string(),
                event: event.clone(),
            };
            if sender.send(delivery).await.is_err() {
                self.inner.finish_one();
                return Err(BusError::Closed);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Uuid, BusError> {
        validate_pattern(pattern)?;
        let (sender, receiver) = mpsc::channel(self.inner.config.channel_capacity.max(1));
        let id = Uuid::new_v4();

        self.inner.subscriptions.write().await.push(Subscription {
            id,
            pattern: pattern.to_string(),
            sender,
        });
        debug!(pattern, handler = handler.name(), subscription_id = %id, "Subscribed");

        tokio::spawn(Self::run_worker(self.inner.clone(), id, receiver, handler));
        Ok(id)
    }
}
