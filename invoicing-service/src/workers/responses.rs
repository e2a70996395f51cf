use async_trait::async_trait;
use service_core::messaging::{Delivery, HandleOutcome, MessageHandler};
use tracing::{debug, error};

use super::settle;
use crate::models::InvoiceResponseMessage;
use crate::services::reconciler::ResponseReconciler;

/// Applies provider responses from `invoicing.responses`. Every delivery is
/// acknowledged; a response that cannot be applied is logged.
pub struct ResponseHandler {
    reconciler: ResponseReconciler,
}

impl ResponseHandler {
    pub fn new(reconciler: ResponseReconciler) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl MessageHandler for ResponseHandler {
    async fn handle(&self, delivery: &Delivery) -> HandleOutcome {
        let response: InvoiceResponseMessage = match delivery.json() {
            Ok(response) => response,
            Err(e) => {
                error!(queue = %delivery.queue, error = %e, "Malformed provider response, dropping");
                return settle(&delivery.queue, HandleOutcome::Ack, "malformed");
            }
        };

        match self.reconciler.reconcile(&response).await {
            Ok(reconciled) => {
                debug!(?reconciled, invoice_id = ?response.invoice_id, "Response applied");
                settle(&delivery.queue, HandleOutcome::Ack, "processed")
            }
            Err(e) => {
                error!(invoice_id = ?response.invoice_id, correlation_id = ?response.correlation_id, code = e.code(), error = %e, "Failed to apply provider response");
                settle(&delivery.queue, HandleOutcome::Ack, "failed")
            }
        }
    }
}
