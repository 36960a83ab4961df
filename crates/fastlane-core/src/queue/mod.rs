//! Reliable delayed work queues
//!
//! Four named streams drive the engine: `jobs` (ready-to-dispatch),
//! `monitor` (poll a running execution), `webhooks` (outbound callbacks)
//! and `notify` (terminal-state side-effects). The primitive is a sorted
//! set keyed by visibility timestamp: push-at-delay, pop with a visibility
//! timeout (unacked messages reappear, so delivery is at-least-once), ack,
//! and release.
//!
//! Queues are ephemeral hints; on conflict with the Store, the Store wins.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ExecutionId, JobId, JobStatus};
use crate::Result;

pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// The four engine streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Ready-to-dispatch jobs
    Jobs,

    /// Executions awaiting a poll
    Monitor,

    /// Outbound callbacks
    Webhooks,

    /// Terminal-state side-effects
    Notify,
}

impl QueueName {
    /// Stream name used in keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Jobs => "jobs",
            QueueName::Monitor => "monitor",
            QueueName::Webhooks => "webhooks",
            QueueName::Notify => "notify",
        }
    }

    /// All streams, in drain order
    pub fn all() -> [QueueName; 4] {
        [QueueName::Jobs, QueueName::Monitor, QueueName::Webhooks, QueueName::Notify]
    }
}

/// A popped message; the receipt is what ack/release operate on
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw member as stored; round-trips through ack/release
    pub receipt: String,
}

/// The queue primitive the engine consumes
#[async_trait]
pub trait Queue: Send + Sync {
    /// Stream name
    fn name(&self) -> &str;

    /// Push a payload, visible after `delay`
    async fn push(&self, payload: &str, delay: Duration) -> Result<()>;

    /// Pop one due message; it stays invisible for `visibility` unless acked
    async fn pop(&self, visibility: Duration) -> Result<Option<Delivery>>;

    /// Delete a handled message
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Make a message visible again immediately
    async fn release(&self, delivery: &Delivery) -> Result<()>;

    /// Messages in the stream (visible or not)
    async fn len(&self) -> Result<usize>;
}

/// Wire envelope: a unique id keeps identical payloads distinct members
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    body: serde_json::Value,
}

/// Serialize and push a typed message
pub async fn push_message<T: Serialize>(
    queue: &dyn Queue,
    message: &T,
    delay: Duration,
) -> Result<()> {
    let envelope = Envelope { id: Uuid::new_v4(), body: serde_json::to_value(message)? };
    queue.push(&serde_json::to_string(&envelope)?, delay).await
}

/// Decode a typed message out of a delivery
pub fn decode_message<T: DeserializeOwned>(delivery: &Delivery) -> Result<T> {
    let envelope: Envelope = serde_json::from_str(&delivery.receipt)?;
    Ok(serde_json::from_value(envelope.body)?)
}

/// Ask the dispatcher to start (or restart) a job attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    /// Target job
    pub job_id: JobId,

    /// Requeues consumed so far (saturation / transient infra)
    #[serde(default)]
    pub requeues: u32,
}

impl JobMessage {
    /// First delivery for a job
    pub fn new(job_id: JobId) -> Self {
        Self { job_id, requeues: 0 }
    }
}

/// Ask the monitor to observe an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorMessage {
    /// Owning job
    pub job_id: JobId,

    /// Execution under observation
    pub execution_id: ExecutionId,
}

/// Deliver one webhook callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    /// Owning job
    pub job_id: JobId,

    /// Execution the callback reports on; absent when the job expired
    /// before its first attempt
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,

    /// Destination URL
    pub url: String,

    /// Delivery attempts consumed so far
    #[serde(default)]
    pub attempts: u32,
}

/// Fan out terminal-state notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMessage {
    /// Owning job
    pub job_id: JobId,

    /// Terminal status reached
    pub status: JobStatus,
}

/// The four streams an engine process owns
#[derive(Clone)]
pub struct WorkQueues {
    /// Ready-to-dispatch jobs
    pub jobs: Arc<dyn Queue>,

    /// Executions awaiting a poll
    pub monitor: Arc<dyn Queue>,

    /// Outbound callbacks
    pub webhooks: Arc<dyn Queue>,

    /// Terminal-state side-effects
    pub notify: Arc<dyn Queue>,
}

impl WorkQueues {
    /// Look a stream up by name
    pub fn get(&self, name: QueueName) -> &Arc<dyn Queue> {
        match name {
            QueueName::Jobs => &self.jobs,
            QueueName::Monitor => &self.monitor,
            QueueName::Webhooks => &self.webhooks,
            QueueName::Notify => &self.notify,
        }
    }

    /// In-memory streams for tests
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(MemoryQueue::new(QueueName::Jobs.as_str())),
            monitor: Arc::new(MemoryQueue::new(QueueName::Monitor.as_str())),
            webhooks: Arc::new(MemoryQueue::new(QueueName::Webhooks.as_str())),
            notify: Arc::new(MemoryQueue::new(QueueName::Notify.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_typed_round_trip() {
        let queue = MemoryQueue::new("jobs");
        let message = JobMessage::new(ulid::Ulid::new());
        push_message(&queue, &message, Duration::ZERO).await.unwrap();

        let delivery = queue.pop(Duration::from_secs(30)).await.unwrap().unwrap();
        let decoded: JobMessage = decode_message(&delivery).unwrap();
        assert_eq!(decoded.job_id, message.job_id);
        assert_eq!(decoded.requeues, 0);
    }

    #[tokio::test]
    async fn test_identical_payloads_stay_distinct() {
        let queue = MemoryQueue::new("jobs");
        let message = JobMessage::new(ulid::Ulid::new());
        push_message(&queue, &message, Duration::ZERO).await.unwrap();
        push_message(&queue, &message, Duration::ZERO).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }
}
