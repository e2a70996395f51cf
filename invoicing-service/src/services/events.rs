//! Realtime notifications and domain events.
//!
//! Both are best-effort: the persisted state change is the source of truth and
//! a failed notification never fails the operation that produced it.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use service_core::messaging::{publish_json, MessageBroker};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{DomainEvent, Invoice, RealtimeEvent};
use crate::services::metrics::REALTIME_EVENTS_TOTAL;

const PUBLISH_BUFFER: usize = 1024;

/// Fan-out of realtime events to connected clients.
///
/// `publish` only enqueues; delivery happens elsewhere.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: RealtimeEvent);
}

/// Ships events to a Redis pub/sub channel from a background task.
#[derive(Clone)]
pub struct RedisEventPublisher {
    sender: mpsc::Sender<RealtimeEvent>,
}

impl RedisEventPublisher {
    /// Connect and start the shipping task. The task drains what is already
    /// queued and exits once `shutdown` fires.
    pub async fn connect(
        url: &str,
        channel: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), anyhow::Error> {
        let client = Client::open(url)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;

        let (sender, receiver) = mpsc::channel(PUBLISH_BUFFER);
        let task = tokio::spawn(ship(manager, channel.to_string(), receiver, shutdown));
        tracing::info!(channel = %channel, "Realtime event publisher started");

        Ok((Self { sender }, task))
    }
}

impl EventPublisher for RedisEventPublisher {
    fn publish(&self, event: RealtimeEvent) {
        let event_type = event.event_type.as_str();
        if let Err(e) = self.sender.try_send(event) {
            REALTIME_EVENTS_TOTAL
                .with_label_values(&[event_type, "dropped"])
                .inc();
            warn!(event_type, error = %e, "Realtime event dropped");
        }
    }
}

async fn ship(
    manager: ConnectionManager,
    channel: String,
    mut receiver: mpsc::Receiver<RealtimeEvent>,
    shutdown: CancellationToken,
) {
    let mut closed = false;
    loop {
        let event = tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled(), if !closed => {
                // Stop accepting new events; buffered ones are still shipped.
                receiver.close();
                closed = true;
                continue;
            }
        };

        let event_type = event.event_type.as_str();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_type, error = %e, "Failed to encode realtime event");
                continue;
            }
        };

        let mut conn = manager.clone();
        let published: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match published {
            Ok(receivers) => {
                REALTIME_EVENTS_TOTAL
                    .with_label_values(&[event_type, "published"])
                    .inc();
                debug!(event_type, business_id = %event.business_id, receivers, "Realtime event published");
            }
            Err(e) => {
                REALTIME_EVENTS_TOTAL
                    .with_label_values(&[event_type, "failed"])
                    .inc();
                warn!(event_type, error = %e, "Failed to publish realtime event");
            }
        }
    }
    tracing::info!("Realtime event publisher stopped");
}

/// Substituted when pub/sub is unavailable at startup.
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, event: RealtimeEvent) {
        debug!(event_type = event.event_type.as_str(), "Realtime publishing disabled, event discarded");
    }
}

/// Publishes invoice lifecycle events for other services on the broker.
#[derive(Clone)]
pub struct DomainEventPublisher {
    broker: Arc<dyn MessageBroker>,
    queue: String,
}

impl DomainEventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    pub async fn emit(&self, event_type: &str, invoice: &Invoice, data: serde_json::Value) {
        let event = DomainEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            business_id: invoice.business_id,
            invoice_id: invoice.invoice_id,
            order_id: invoice.order_id,
            occurred_at: Utc::now(),
            data,
        };
        if let Err(e) = publish_json(self.broker.as_ref(), &self.queue, &event).await {
            warn!(event_type, invoice_id = %invoice.invoice_id, error = %e, "Failed to publish domain event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::messaging::MemoryBroker;

    #[tokio::test]
    async fn domain_event_failures_are_swallowed() {
        let broker = MemoryBroker::new();
        broker.set_publish_failure(true);
        let events = DomainEventPublisher::new(Arc::new(broker.clone()), "invoicing.events");

        let invoice: Invoice = serde_json::from_value(serde_json::json!({
            "invoice_id": Uuid::new_v4(),
            "business_id": Uuid::new_v4(),
            "order_id": Uuid::new_v4(),
            "invoicing_integration_id": Uuid::new_v4(),
            "provider": "softpymes",
            "subtotal": "0", "tax": "0", "discount": "0", "shipping_cost": "0",
            "total_amount": "0",
            "currency": "COP",
            "customer": { "name": "Ana", "email": null, "phone": null, "dni": null },
            "status": "issued",
            "external_id": null, "invoice_number": null, "invoice_url": null,
            "pdf_url": null, "xml_url": null, "cufe": null, "provider_response": null,
            "metadata": {},
            "created_utc": "2026-03-01T00:00:00Z",
            "updated_utc": "2026-03-01T00:00:00Z",
            "issued_utc": null, "cancelled_utc": null, "expires_utc": null
        }))
        .unwrap();

        events.emit("invoice.issued", &invoice, serde_json::json!({})).await;
        assert!(broker.is_empty("invoicing.events"));

        broker.set_publish_failure(false);
        events.emit("invoice.issued", &invoice, serde_json::json!({})).await;
        let published: Vec<DomainEvent> = broker.drain_json("invoicing.events");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].invoice_id, invoice.invoice_id);
    }
}
