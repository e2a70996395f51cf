//! Applies provider responses to invoices, attempts and bulk jobs.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::InvoicingError;
use crate::models::{
    Invoice, InvoiceResponseMessage, InvoiceStatus, IssuedInvoice, RealtimeEvent,
    RealtimeEventType, ResponseStatus, SyncLog, SyncLogCompletion, SyncOperation,
};
use crate::services::bulk::BulkService;
use crate::services::compare::CompareService;
use crate::services::events::{DomainEventPublisher, EventPublisher};
use crate::services::invoicing::{invoice_payload, InvoicingService};
use crate::services::metrics::INVOICES_TOTAL;
use crate::services::repository::InvoicingStore;

/// What a response did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Issued,
    Failed,
    Cancelled,
    CancelRejected,
    /// First-seen outcome already applied, or the response belongs to a
    /// superseded attempt; at most the attempt was closed.
    Stale,
    Compared,
    Dropped,
}

#[derive(Clone)]
pub struct ResponseReconciler {
    store: Arc<dyn InvoicingStore>,
    invoicing: InvoicingService,
    bulk: BulkService,
    compare: CompareService,
    realtime: Arc<dyn EventPublisher>,
    domain_events: DomainEventPublisher,
}

impl ResponseReconciler {
    pub fn new(
        store: Arc<dyn InvoicingStore>,
        invoicing: InvoicingService,
        bulk: BulkService,
        compare: CompareService,
        realtime: Arc<dyn EventPublisher>,
        domain_events: DomainEventPublisher,
    ) -> Self {
        Self {
            store,
            invoicing,
            bulk,
            compare,
            realtime,
            domain_events,
        }
    }

    #[instrument(skip(self, response), fields(component = "reconciler", invoice_id = ?response.invoice_id, correlation_id = ?response.correlation_id))]
    pub async fn reconcile(
        &self,
        response: &InvoiceResponseMessage,
    ) -> Result<Reconciled, InvoicingError> {
        if response.is_compare() {
            self.compare.handle_response(response).await?;
            return Ok(Reconciled::Compared);
        }

        let Some(invoice_id) = response.invoice_id else {
            warn!("Response without invoice id, dropping");
            return Ok(Reconciled::Dropped);
        };
        let Some(invoice) = self.store.get_invoice(invoice_id).await? else {
            warn!("Response for unknown invoice, dropping");
            return Ok(Reconciled::Dropped);
        };

        let attempt = self.bind_attempt(&invoice, response).await?;
        if attempt.is_none() {
            warn!("No attempt history for invoice, applying response without ledger");
        }

        let operation = attempt
            .as_ref()
            .map(|a| a.operation)
            .or(response.operation)
            .unwrap_or(SyncOperation::Create);

        match (operation, response.status) {
            (SyncOperation::Cancel, ResponseStatus::Success) => {
                self.apply_cancelled(invoice, attempt.as_ref(), response).await
            }
            (SyncOperation::Cancel, ResponseStatus::Error) => {
                if let Some(attempt) = &attempt {
                    self.close_failed(attempt, response, false).await?;
                }
                warn!(error = %response.error_message(), "Provider rejected cancellation");
                Ok(Reconciled::CancelRejected)
            }
            (_, ResponseStatus::Success) => {
                self.apply_success(invoice, attempt.as_ref(), response).await
            }
            (_, ResponseStatus::Error) => {
                self.apply_failure(invoice, attempt.as_ref(), response).await
            }
        }
    }

    /// The attempt named by the correlation id, else the invoice's latest one.
    async fn bind_attempt(
        &self,
        invoice: &Invoice,
        response: &InvoiceResponseMessage,
    ) -> Result<Option<SyncLog>, InvoicingError> {
        if let Some(correlation_id) = response.correlation_id {
            if let Some(attempt) = self
                .store
                .get_sync_log_by_correlation(correlation_id)
                .await?
                .filter(|a| a.invoice_id == invoice.invoice_id)
            {
                return Ok(Some(attempt));
            }
        }
        self.store.get_latest_sync_log(invoice.invoice_id).await
    }

    async fn apply_success(
        &self,
        invoice: Invoice,
        attempt: Option<&SyncLog>,
        response: &InvoiceResponseMessage,
    ) -> Result<Reconciled, InvoicingError> {
        let issued = IssuedInvoice {
            external_id: response.external_id.clone(),
            invoice_number: response.invoice_number.clone(),
            invoice_url: response.invoice_url.clone(),
            pdf_url: response.pdf_url.clone(),
            xml_url: response.xml_url.clone(),
            cufe: response.cufe.clone(),
            issued_utc: response.issued_at_utc().unwrap_or_else(Utc::now),
            provider_response: response
                .document_json
                .clone()
                .or_else(|| serde_json::to_value(response).ok()),
        };
        let transitioned = self
            .store
            .mark_invoice_issued(invoice.invoice_id, &issued)
            .await?;

        if let Some(attempt) = attempt.filter(|a| a.status.is_open()) {
            self.store
                .complete_sync_log(
                    attempt.sync_log_id,
                    &SyncLogCompletion::success(attempt.started_utc, response.audit()),
                )
                .await?;
        }

        if !transitioned {
            info!(status = invoice.status.as_str(), "Success for invoice already settled, ignoring");
            return Ok(Reconciled::Stale);
        }

        INVOICES_TOTAL.with_label_values(&["issued"]).inc();
        self.store
            .record_order_invoice(
                invoice.order_id,
                issued.invoice_number.as_deref(),
                issued.invoice_url.as_deref(),
            )
            .await?;

        let invoice = self
            .store
            .get_invoice(invoice.invoice_id)
            .await?
            .ok_or(InvoicingError::InvoiceNotFound(invoice.invoice_id))?;
        info!(invoice_number = ?invoice.invoice_number, "Invoice issued");

        self.realtime.publish(RealtimeEvent::new(
            RealtimeEventType::InvoiceCreated,
            invoice.business_id,
            invoice_payload(&invoice),
        ));
        self.domain_events
            .emit("invoice.issued", &invoice, invoice_payload(&invoice))
            .await;

        self.bulk.record_outcome(invoice.invoice_id, true, None).await?;
        Ok(Reconciled::Issued)
    }

    async fn apply_failure(
        &self,
        invoice: Invoice,
        attempt: Option<&SyncLog>,
        response: &InvoiceResponseMessage,
    ) -> Result<Reconciled, InvoicingError> {
        // Errors only count against the live attempt. A redelivered error for
        // an attempt that is closed or superseded leaves the invoice alone.
        if let Some(attempt) = attempt {
            if !self.is_live(attempt).await? {
                if attempt.status.is_open() {
                    self.close_failed(attempt, response, false).await?;
                }
                info!(sync_log_id = %attempt.sync_log_id, "Error for a superseded attempt, ignoring");
                return Ok(Reconciled::Stale);
            }
        }

        let transitioned = self
            .store
            .transition_invoice(
                invoice.invoice_id,
                &[InvoiceStatus::Draft, InvoiceStatus::Pending],
                InvoiceStatus::Failed,
            )
            .await?;

        let mut closed = None;
        if let Some(attempt) = attempt {
            closed = Some(self.close_failed(attempt, response, transitioned).await?);
        }

        if !transitioned {
            info!(status = invoice.status.as_str(), "Error for invoice already settled, ignoring");
            return Ok(Reconciled::Stale);
        }

        INVOICES_TOTAL.with_label_values(&["failed"]).inc();
        let invoice = self
            .store
            .get_invoice(invoice.invoice_id)
            .await?
            .ok_or(InvoicingError::InvoiceNotFound(invoice.invoice_id))?;
        warn!(
            error_code = ?response.error_code,
            error = %response.error_message(),
            next_retry_utc = ?closed.as_ref().and_then(|c| c.next_retry_utc),
            "Invoice failed at provider"
        );

        let mut data = invoice_payload(&invoice);
        data["error"] = response.error_message().into();
        data["error_code"] = serde_json::to_value(&response.error_code).unwrap_or_default();
        data["next_retry_utc"] =
            serde_json::to_value(closed.as_ref().and_then(|c| c.next_retry_utc))
                .unwrap_or_default();

        self.realtime.publish(RealtimeEvent::new(
            RealtimeEventType::InvoiceFailed,
            invoice.business_id,
            data.clone(),
        ));
        self.domain_events
            .emit("invoice.failed", &invoice, data)
            .await;

        self.bulk
            .record_outcome(invoice.invoice_id, false, Some(response.error_message()))
            .await?;
        Ok(Reconciled::Failed)
    }

    async fn apply_cancelled(
        &self,
        invoice: Invoice,
        attempt: Option<&SyncLog>,
        response: &InvoiceResponseMessage,
    ) -> Result<Reconciled, InvoicingError> {
        let transitioned = self
            .store
            .transition_invoice(
                invoice.invoice_id,
                &[InvoiceStatus::Issued],
                InvoiceStatus::Cancelled,
            )
            .await?;

        if let Some(attempt) = attempt.filter(|a| a.status.is_open()) {
            self.store
                .complete_sync_log(
                    attempt.sync_log_id,
                    &SyncLogCompletion::success(attempt.started_utc, response.audit()),
                )
                .await?;
        }

        if !transitioned {
            return Ok(Reconciled::Stale);
        }

        INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
        let invoice = self
            .store
            .get_invoice(invoice.invoice_id)
            .await?
            .ok_or(InvoicingError::InvoiceNotFound(invoice.invoice_id))?;
        info!("Invoice cancelled at provider");
        self.invoicing.announce_cancelled(&invoice).await;
        Ok(Reconciled::Cancelled)
    }

    /// Open and still the newest attempt of its invoice.
    async fn is_live(&self, attempt: &SyncLog) -> Result<bool, InvoicingError> {
        if !attempt.status.is_open() {
            return Ok(false);
        }
        let latest = self.store.get_latest_sync_log(attempt.invoice_id).await?;
        Ok(latest.map_or(true, |l| l.sync_log_id == attempt.sync_log_id))
    }

    /// Close an attempt as failed. `schedule` is false when the invoice is
    /// no longer retryable, so no next attempt is planned.
    async fn close_failed(
        &self,
        attempt: &SyncLog,
        response: &InvoiceResponseMessage,
        schedule: bool,
    ) -> Result<SyncLog, InvoicingError> {
        let mut completion = SyncLogCompletion::failure(
            attempt,
            response.error_message(),
            response.error_code.clone(),
            response.error_details.clone(),
            response.audit(),
        );
        if !schedule {
            completion.next_retry_utc = None;
        }
        self.store
            .complete_sync_log(attempt.sync_log_id, &completion)
            .await
    }
}
