pub mod ingestor;
pub mod processor;

pub use ingestor::WebhookIngestor;
pub use processor::{WebhookProcessor, WebhookRetryScanner};

use tokio::sync::mpsc;
use uuid::Uuid;

/// Bounded work queue owned by the processor. The ingestor acknowledges the
/// provider as soon as the event row is durable and the id is enqueued;
/// dropping every sender drains the worker on shutdown, and a full queue is
/// explicit backpressure rather than an unbounded task spawn.
pub fn webhook_queue(capacity: usize) -> (WebhookQueueSender, mpsc::Receiver<Uuid>) {
    let (tx, rx) = mpsc::channel(capacity);
    (WebhookQueueSender(tx), rx)
}

#[derive(Clone)]
pub struct WebhookQueueSender(mpsc::Sender<Uuid>);

impl WebhookQueueSender {
    /// Non-blocking enqueue; false means the queue is full (or closing) and
    /// the event stays behind for the retry scanner.
    pub fn try_enqueue(&self, event_id: Uuid) -> bool {
        self.0.try_send(event_id).is_ok()
    }

    pub async fn enqueue(&self, event_id: Uuid) -> bool {
        self.0.send(event_id).await.is_ok()
    }
}
