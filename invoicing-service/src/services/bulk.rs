//! Bulk invoicing jobs.
//!
//! A job fans out into one broker message per order. Counters only move by
//! atomic increments: `processed` when an item leaves the worker, and
//! `successful`/`failed` when its outcome is known (before dispatch for
//! rejected orders, from the reconciler otherwise).

use serde_json::json;
use service_core::messaging::{publish_json, MessageBroker};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    BulkCounterDelta, BulkCreateMessage, BulkItemStatus, BulkJob, BulkJobItem, RealtimeEvent,
    RealtimeEventType, TriggerSource, MAX_BULK_ORDERS,
};
use crate::services::events::EventPublisher;
use crate::services::invoicing::{CreateInvoiceIntent, InvoicingService};
use crate::services::repository::InvoicingStore;

#[derive(Clone)]
pub struct BulkService {
    store: Arc<dyn InvoicingStore>,
    invoicing: InvoicingService,
    broker: Arc<dyn MessageBroker>,
    queue: String,
    realtime: Arc<dyn EventPublisher>,
}

impl BulkService {
    pub fn new(
        store: Arc<dyn InvoicingStore>,
        invoicing: InvoicingService,
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        realtime: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            invoicing,
            broker,
            queue: queue.into(),
            realtime,
        }
    }

    /// Persist a job and enqueue one work item per order.
    #[instrument(skip(self, order_ids), fields(component = "bulk", orders = order_ids.len()))]
    pub async fn create_bulk(
        &self,
        business_id: Uuid,
        created_by: Option<Uuid>,
        order_ids: &[Uuid],
    ) -> Result<BulkJob, InvoicingError> {
        if order_ids.is_empty() {
            return Err(InvoicingError::InvalidInput(
                "at least one order is required".to_string(),
            ));
        }
        if order_ids.len() > MAX_BULK_ORDERS {
            return Err(InvoicingError::InvalidInput(format!(
                "a bulk job accepts at most {} orders",
                MAX_BULK_ORDERS
            )));
        }
        let mut seen = HashSet::with_capacity(order_ids.len());
        if let Some(duplicate) = order_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(InvoicingError::InvalidInput(format!(
                "order {} is listed more than once",
                duplicate
            )));
        }

        let (job, items) = self
            .store
            .create_bulk_job(business_id, created_by, order_ids)
            .await?;
        info!(job_id = %job.job_id, "Bulk job created");

        let mut published = 0usize;
        for item in &items {
            let message = BulkCreateMessage {
                job_id: job.job_id,
                order_id: item.order_id,
                business_id,
                is_manual: true,
                created_by,
                attempt_number: 1,
            };
            match publish_json(self.broker.as_ref(), &self.queue, &message).await {
                Ok(()) => {
                    published += 1;
                    if published == 1 {
                        self.store.mark_bulk_job_processing(job.job_id).await?;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, order_id = %item.order_id, error = %e, "Failed to enqueue bulk item");
                    self.fail_item(item, format!("failed to enqueue: {}", e))
                        .await?;
                }
            }
        }

        let job = self
            .store
            .get_bulk_job(job.job_id)
            .await?
            .ok_or(InvoicingError::BulkJobNotFound(job.job_id))?;
        info!(job_id = %job.job_id, published, "Bulk job enqueued");
        Ok(job)
    }

    /// Handle one work item from the bulk queue.
    #[instrument(skip(self, message), fields(component = "bulk_worker", job_id = %message.job_id, order_id = %message.order_id))]
    pub async fn process(&self, message: &BulkCreateMessage) -> Result<(), InvoicingError> {
        let Some(item) = self
            .store
            .get_bulk_item(message.job_id, message.order_id)
            .await?
        else {
            warn!("Bulk item not found, dropping message");
            return Ok(());
        };

        let claimed = self
            .store
            .transition_bulk_item(
                item.item_id,
                &[BulkItemStatus::Pending],
                BulkItemStatus::Processing,
                None,
                None,
            )
            .await?;
        if !claimed {
            info!(status = item.status.as_str(), "Bulk item already handled");
            return Ok(());
        }

        let intent = CreateInvoiceIntent {
            order_id: message.order_id,
            business_id: Some(message.business_id),
            invoicing_integration_id: None,
            trigger: if message.is_manual {
                TriggerSource::Manual
            } else {
                TriggerSource::Auto
            },
            user_id: message.created_by,
            bulk_item_id: Some(item.item_id),
        };

        match self.invoicing.create_invoice(intent).await {
            Ok(invoice) => {
                info!(invoice_id = %invoice.invoice_id, "Bulk item dispatched");
                let job = self
                    .store
                    .increment_bulk_counters(message.job_id, BulkCounterDelta::dispatched())
                    .await?;
                self.publish_progress(&job);
            }
            Err(e) => {
                info!(code = e.code(), error = %e, "Bulk item failed before dispatch");
                let failed = self
                    .store
                    .transition_bulk_item(
                        item.item_id,
                        &[BulkItemStatus::Processing],
                        BulkItemStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await?;
                if failed {
                    let job = self
                        .store
                        .increment_bulk_counters(
                            message.job_id,
                            BulkCounterDelta::failed_before_dispatch(),
                        )
                        .await?;
                    self.publish_progress(&job);
                    self.finish_if_settled(&job).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply a provider outcome to the bulk item linked to `invoice_id`, if any.
    pub async fn record_outcome(
        &self,
        invoice_id: Uuid,
        success: bool,
        error_message: Option<String>,
    ) -> Result<(), InvoicingError> {
        let Some(item) = self.store.get_bulk_item_by_invoice(invoice_id).await? else {
            return Ok(());
        };

        let (to, delta) = if success {
            (BulkItemStatus::Success, BulkCounterDelta::succeeded())
        } else {
            (BulkItemStatus::Failed, BulkCounterDelta::failed())
        };
        let moved = self
            .store
            .transition_bulk_item(
                item.item_id,
                &[BulkItemStatus::Processing],
                to,
                Some(invoice_id),
                error_message,
            )
            .await?;
        if !moved {
            return Ok(());
        }

        let job = self
            .store
            .increment_bulk_counters(item.job_id, delta)
            .await?;
        self.publish_progress(&job);
        self.finish_if_settled(&job).await
    }

    /// Job visible to `business_id` (`None` sees every business), with its items.
    pub async fn get_status(
        &self,
        job_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<(BulkJob, Vec<BulkJobItem>), InvoicingError> {
        let job = self
            .store
            .get_bulk_job(job_id)
            .await?
            .filter(|j| business_id.map_or(true, |b| j.business_id == b))
            .ok_or(InvoicingError::BulkJobNotFound(job_id))?;
        let items = self.store.get_bulk_job_items(job_id).await?;
        Ok((job, items))
    }

    pub async fn list(
        &self,
        business_id: Option<Uuid>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<BulkJob>, i64), InvoicingError> {
        self.store.list_bulk_jobs(business_id, page, page_size).await
    }

    async fn fail_item(&self, item: &BulkJobItem, reason: String) -> Result<(), InvoicingError> {
        let failed = self
            .store
            .transition_bulk_item(
                item.item_id,
                &[BulkItemStatus::Pending],
                BulkItemStatus::Failed,
                None,
                Some(reason),
            )
            .await?;
        if failed {
            let job = self
                .store
                .increment_bulk_counters(item.job_id, BulkCounterDelta::failed_before_dispatch())
                .await?;
            self.publish_progress(&job);
            self.finish_if_settled(&job).await?;
        }
        Ok(())
    }

    async fn finish_if_settled(&self, job: &BulkJob) -> Result<(), InvoicingError> {
        if !job.is_settled() {
            return Ok(());
        }
        if let Some(completed) = self.store.complete_bulk_job(job.job_id).await? {
            info!(
                job_id = %completed.job_id,
                successful = completed.successful,
                failed = completed.failed,
                "Bulk job completed"
            );
            self.realtime.publish(RealtimeEvent::new(
                RealtimeEventType::BulkJobCompleted,
                completed.business_id,
                job_payload(&completed),
            ));
        }
        Ok(())
    }

    fn publish_progress(&self, job: &BulkJob) {
        self.realtime.publish(RealtimeEvent::new(
            RealtimeEventType::BulkJobProgress,
            job.business_id,
            job_payload(job),
        ));
    }
}

fn job_payload(job: &BulkJob) -> serde_json::Value {
    json!({
        "job_id": job.job_id,
        "status": job.status,
        "total_orders": job.total_orders,
        "processed": job.processed,
        "successful": job.successful,
        "failed": job.failed,
        "progress_percent": job.progress_percent(),
    })
}

