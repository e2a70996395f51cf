//! Queue-oriented message broker abstraction.
//!
//! Services publish JSON payloads to named queues and consume them through a
//! [`Subscription`]. Deliveries are acknowledged (or requeued) through the
//! broker after the handler finishes, which lets a consumer process several
//! deliveries concurrently while a single task owns the subscription.

mod consumer;
mod memory;
mod redis_list;

pub use consumer::{ConsumerSettings, HandleOutcome, MessageHandler, QueueConsumer};
pub use memory::MemoryBroker;
pub use redis_list::RedisBroker;

use crate::error::AppError;
use async_trait::async_trait;
use std::time::Duration;

/// A message taken from a queue and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    /// Broker-specific key of the in-flight list holding this delivery.
    pub receipt: Option<String>,
}

impl Delivery {
    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), AppError>;

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, AppError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Return the delivery to the back of its queue.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `wait` for the next delivery.
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, AppError>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: serde::Serialize + Sync>(
    broker: &dyn MessageBroker,
    queue: &str,
    message: &T,
) -> Result<(), AppError> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode message: {}", e)))?;
    broker.publish(queue, &payload).await
}
