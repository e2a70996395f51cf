use async_trait::async_trait;
use service_core::messaging::{Delivery, HandleOutcome, MessageHandler};
use tracing::error;

use super::settle;
use crate::models::BulkCreateMessage;
use crate::services::bulk::BulkService;

/// Runs the create path for each order of a bulk job.
pub struct BulkWorker {
    bulk: BulkService,
}

impl BulkWorker {
    pub fn new(bulk: BulkService) -> Self {
        Self { bulk }
    }
}

#[async_trait]
impl MessageHandler for BulkWorker {
    async fn handle(&self, delivery: &Delivery) -> HandleOutcome {
        let message: BulkCreateMessage = match delivery.json() {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %delivery.queue, error = %e, "Malformed bulk work item, dropping");
                return settle(&delivery.queue, HandleOutcome::Ack, "malformed");
            }
        };

        match self.bulk.process(&message).await {
            Ok(()) => settle(&delivery.queue, HandleOutcome::Ack, "processed"),
            Err(e) => {
                error!(job_id = %message.job_id, order_id = %message.order_id, error = %e, "Bulk work item failed");
                settle(&delivery.queue, HandleOutcome::Ack, "failed")
            }
        }
    }
}
