//! Redis-list transport.
//!
//! `LPUSH` publishes, `BRPOPLPUSH` moves a message into a per-consumer
//! processing list, `LREM` acknowledges it.

use super::{Delivery, MessageBroker, Subscription};
use crate::error::AppError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    manager: ConnectionManager,
    consumer_id: String,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting message broker to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager for broker");
            AppError::BrokerError(anyhow::anyhow!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            client,
            manager,
            consumer_id: Uuid::new_v4().to_string(),
        })
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:processing:{}", queue, self.consumer_id)
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::BrokerError(anyhow::anyhow!("Failed to publish to {}: {}", queue, e)))?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, AppError> {
        // Blocking pops get their own connection so they never stall publishes.
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::BrokerError(anyhow::anyhow!("Failed to open subscription: {}", e)))?;

        Ok(Box::new(RedisSubscription {
            conn,
            queue: queue.to_string(),
            processing: self.processing_key(queue),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let Some(processing) = delivery.receipt.as_deref() else {
            return Ok(());
        };
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(processing)
            .arg(1)
            .arg(delivery.payload.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::BrokerError(anyhow::anyhow!("Failed to ack delivery: {}", e)))?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(processing) = delivery.receipt.as_deref() {
            pipe.cmd("LREM")
                .arg(processing)
                .arg(1)
                .arg(delivery.payload.as_slice())
                .ignore();
        }
        pipe.cmd("LPUSH")
            .arg(&delivery.queue)
            .arg(delivery.payload.as_slice())
            .ignore();

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::BrokerError(anyhow::anyhow!("Failed to requeue delivery: {}", e)))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::BrokerError(anyhow::anyhow!("Broker health check failed: {}", e)))?;
        Ok(())
    }
}

struct RedisSubscription {
    conn: MultiplexedConnection,
    queue: String,
    processing: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, AppError> {
        // A zero timeout blocks forever in Redis.
        let seconds = wait.as_secs().max(1);
        let payload: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg(seconds)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| {
                AppError::BrokerError(anyhow::anyhow!("Failed to receive from {}: {}", self.queue, e))
            })?;

        Ok(payload.map(|payload| Delivery {
            queue: self.queue.clone(),
            payload,
            receipt: Some(self.processing.clone()),
        }))
    }
}
