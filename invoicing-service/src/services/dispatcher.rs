//! Publishes provider requests onto the shared request queue.

use chrono::Utc;
use service_core::messaging::{publish_json, MessageBroker};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    Invoice, InvoiceData, InvoiceItem, InvoiceRequestMessage, ProviderConfig, RequestItem,
    RequestTotals, SyncOperation,
};
use crate::services::metrics::DISPATCHES_TOTAL;

#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn MessageBroker>,
    queue: String,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn MessageBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fire-and-forget publish. The response arrives later on the response
    /// queue and is bound back through `correlation_id`.
    #[instrument(skip(self, request), fields(component = "dispatcher", correlation_id = %request.correlation_id, operation = request.operation.as_str()))]
    pub async fn dispatch(&self, request: &InvoiceRequestMessage) -> Result<(), InvoicingError> {
        let operation = request.operation.as_str();
        match publish_json(self.broker.as_ref(), &self.queue, request).await {
            Ok(()) => {
                DISPATCHES_TOTAL
                    .with_label_values(&[operation, "published"])
                    .inc();
                info!(invoice_id = ?request.invoice_id, provider = %request.provider, "Provider request published");
                Ok(())
            }
            Err(e) => {
                DISPATCHES_TOTAL.with_label_values(&[operation, "failed"]).inc();
                warn!(invoice_id = ?request.invoice_id, error = %e, "Failed to publish provider request");
                Err(InvoicingError::Publish(e.to_string()))
            }
        }
    }
}

/// Request for an invoice-scoped operation (create, retry, cancel).
pub fn invoice_request(
    invoice: &Invoice,
    items: &[InvoiceItem],
    operation: SyncOperation,
    config: ProviderConfig,
    correlation_id: Uuid,
) -> InvoiceRequestMessage {
    InvoiceRequestMessage {
        invoice_id: Some(invoice.invoice_id),
        provider: invoice.provider.clone(),
        operation,
        invoice_data: InvoiceData {
            integration_id: invoice.invoicing_integration_id,
            items: items.iter().map(request_item).collect(),
            config: config.into_value(),
            customer: Some(invoice.customer.clone()),
            totals: Some(RequestTotals {
                subtotal: invoice.subtotal,
                tax: invoice.tax,
                discount: invoice.discount,
                shipping_cost: invoice.shipping_cost,
                total_amount: invoice.total_amount,
                currency: invoice.currency.clone(),
            }),
            order_id: Some(invoice.order_id),
        },
        correlation_id,
        timestamp: Utc::now(),
    }
}

/// Request for a business-scoped compare; no invoice is attached.
pub fn compare_request(
    provider: &str,
    integration_id: Uuid,
    config: ProviderConfig,
    correlation_id: Uuid,
) -> InvoiceRequestMessage {
    InvoiceRequestMessage {
        invoice_id: None,
        provider: provider.to_string(),
        operation: SyncOperation::Compare,
        invoice_data: InvoiceData {
            integration_id,
            items: Vec::new(),
            config: config.into_value(),
            customer: None,
            totals: None,
            order_id: None,
        },
        correlation_id,
        timestamp: Utc::now(),
    }
}

fn request_item(item: &InvoiceItem) -> RequestItem {
    RequestItem {
        sku: item.sku.clone(),
        name: item.name.clone(),
        description: item.description.clone(),
        quantity: item.quantity,
        unit_price: item.unit_price,
        total_price: item.total_price,
        tax: item.tax,
        tax_rate: item.tax_rate,
        discount: item.discount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use service_core::messaging::MemoryBroker;

    #[tokio::test]
    async fn compare_request_carries_hints_and_no_invoice() {
        let broker = MemoryBroker::new();
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), "invoicing.requests");
        let correlation_id = Uuid::new_v4();
        let config = ProviderConfig::from_value(json!({ "resolution": "FEV" }))
            .with_hints([("date_from".to_string(), json!("2026-03-01"))]);

        dispatcher
            .dispatch(&compare_request("softpymes", Uuid::new_v4(), config, correlation_id))
            .await
            .unwrap();

        let published: Vec<serde_json::Value> = broker.drain_json("invoicing.requests");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["operation"], "compare");
        assert!(published[0]["invoice_id"].is_null());
        assert_eq!(published[0]["correlation_id"], correlation_id.to_string());
        assert_eq!(published[0]["invoice_data"]["config"]["resolution"], "FEV");
        assert_eq!(published[0]["invoice_data"]["config"]["date_from"], "2026-03-01");
    }

    #[tokio::test]
    async fn publish_failure_maps_to_publish_error() {
        let broker = MemoryBroker::new();
        broker.set_publish_failure(true);
        let dispatcher = Dispatcher::new(Arc::new(broker), "invoicing.requests");

        let err = dispatcher
            .dispatch(&compare_request(
                "softpymes",
                Uuid::new_v4(),
                ProviderConfig::default(),
                Uuid::new_v4(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoicingError::Publish(_)));
    }
}
