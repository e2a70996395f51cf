use async_trait::async_trait;
use service_core::messaging::{Delivery, HandleOutcome, MessageHandler};
use tracing::{error, info, warn};

use super::settle;
use crate::models::OrderEvent;
use crate::services::invoicing::{CreateInvoiceIntent, InvoicingService};

/// Auto-invoices orders announced on `orders.events`.
///
/// Business-rule refusals (filters, disabled configs, duplicates) are
/// acknowledged; infrastructure failures go back on the queue.
pub struct OrderEventHandler {
    invoicing: InvoicingService,
}

impl OrderEventHandler {
    pub fn new(invoicing: InvoicingService) -> Self {
        Self { invoicing }
    }
}

#[async_trait]
impl MessageHandler for OrderEventHandler {
    async fn handle(&self, delivery: &Delivery) -> HandleOutcome {
        let event: OrderEvent = match delivery.json() {
            Ok(event) => event,
            Err(e) => {
                error!(queue = %delivery.queue, error = %e, "Malformed order event, dropping");
                return settle(&delivery.queue, HandleOutcome::Ack, "malformed");
            }
        };

        if !event.triggers_invoicing() {
            return settle(&delivery.queue, HandleOutcome::Ack, "ignored");
        }

        let mut intent = CreateInvoiceIntent::auto(event.order_id);
        intent.business_id = Some(event.business_id);

        match self.invoicing.create_invoice(intent).await {
            Ok(invoice) => {
                info!(order_id = %event.order_id, invoice_id = %invoice.invoice_id, event_type = %event.event_type, "Order auto-invoiced");
                settle(&delivery.queue, HandleOutcome::Ack, "processed")
            }
            Err(e) if e.is_transient() => {
                warn!(order_id = %event.order_id, error = %e, "Order event hit a transient error, requeueing");
                settle(&delivery.queue, HandleOutcome::Requeue, "requeued")
            }
            Err(e) if e.is_business_rule() => {
                info!(order_id = %event.order_id, code = e.code(), reason = %e, "Order not invoiced");
                settle(&delivery.queue, HandleOutcome::Ack, "rejected")
            }
            Err(e) => {
                error!(order_id = %event.order_id, code = e.code(), error = %e, "Order event failed");
                settle(&delivery.queue, HandleOutcome::Ack, "failed")
            }
        }
    }
}
