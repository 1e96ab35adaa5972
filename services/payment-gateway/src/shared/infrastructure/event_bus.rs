use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Client;

use paygrid_types::EventEnvelope;

use crate::shared::domain::errors::AppError;

pub const LIFECYCLE_TOPIC: &str = "payments.lifecycle";
pub const PROVIDER_TOPIC: &str = "payments.providers";

/// At-least-once publisher of lifecycle events. Consumers deduplicate by
/// transaction id.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AppError>;
}

/// Pushes JSON envelopes onto a Redis queue per topic.
pub struct RedisEventPublisher {
    client: Client,
    queue_prefix: String,
}

impl RedisEventPublisher {
    pub fn new(redis_url: &str, queue_prefix: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::Cache(format!("Failed to open Redis client: {}", e)))?;
        Ok(Self {
            client,
            queue_prefix: queue_prefix.into(),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AppError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| AppError::Cache(format!("Redis connection error: {}", e)))?;

        let queue = format!("{}:{}", self.queue_prefix, topic);
        let message = serde_json::to_string(envelope)?;

        let _: () = redis::cmd("LPUSH")
            .arg(&queue)
            .arg(&message)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Cache(format!("Failed to publish event: {}", e)))?;

        tracing::debug!(
            event_type = %envelope.event_type,
            correlation_id = %envelope.correlation_id,
            topic,
            "published lifecycle event"
        );

        Ok(())
    }
}

/// Captures events in memory; the test suites assert against it.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    published: Mutex<Vec<(String, EventEnvelope)>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .iter()
            .filter(|(_, e)| e.event_type == event_type)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AppError> {
        self.published
            .lock()
            .push((topic.to_string(), envelope.clone()));
        Ok(())
    }
}
