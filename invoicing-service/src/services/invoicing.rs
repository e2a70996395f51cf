//! Invoice orchestration: the create path, retries, cancellation and reads.

use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    CustomerSnapshot, Invoice, InvoiceItem, InvoiceRequestMessage, InvoiceStats, InvoiceStatus,
    InvoiceSummary, InvoicingConfig, ListInvoicesFilter, NewInvoice, NewInvoiceItem, NewSyncLog,
    Order, ProviderAudit, RealtimeEvent, RealtimeEventType, SyncLog, SyncLogCompletion,
    SyncOperation, SyncStatus, TrendPoint, TriggerSource,
};
use crate::services::config_service::ConfigService;
use crate::services::dispatcher::{invoice_request, Dispatcher};
use crate::services::events::{DomainEventPublisher, EventPublisher};
use crate::services::filters;
use crate::services::metrics::{FILTER_REJECTIONS_TOTAL, INVOICES_TOTAL};
use crate::services::repository::InvoicingStore;

/// Error code stored on an attempt whose request never reached the broker.
pub const PUBLISH_ERROR_CODE: &str = "PUBLISH_ERROR";

/// Longest window the trends endpoint will expand day by day.
const MAX_TREND_DAYS: i64 = 366;

/// A request to invoice one order.
#[derive(Debug, Clone)]
pub struct CreateInvoiceIntent {
    pub order_id: Uuid,
    /// Caller's business; `None` skips the ownership check.
    pub business_id: Option<Uuid>,
    /// Overrides the config's target invoicing integration.
    pub invoicing_integration_id: Option<Uuid>,
    pub trigger: TriggerSource,
    pub user_id: Option<Uuid>,
    /// Bulk item to link to the invoice before the request is published.
    pub bulk_item_id: Option<Uuid>,
}

impl CreateInvoiceIntent {
    pub fn auto(order_id: Uuid) -> Self {
        Self {
            order_id,
            business_id: None,
            invoicing_integration_id: None,
            trigger: TriggerSource::Auto,
            user_id: None,
            bulk_item_id: None,
        }
    }

    pub fn manual(order_id: Uuid, business_id: Option<Uuid>, user_id: Option<Uuid>) -> Self {
        Self {
            trigger: TriggerSource::Manual,
            business_id,
            user_id,
            ..Self::auto(order_id)
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The invoice was never issued and is now cancelled.
    Cancelled(Invoice),
    /// The provider was asked to void an issued invoice.
    Requested(SyncLog),
}

#[derive(Clone)]
pub struct InvoicingService {
    store: Arc<dyn InvoicingStore>,
    configs: ConfigService,
    dispatcher: Dispatcher,
    realtime: Arc<dyn EventPublisher>,
    domain_events: DomainEventPublisher,
}

impl InvoicingService {
    pub fn new(
        store: Arc<dyn InvoicingStore>,
        configs: ConfigService,
        dispatcher: Dispatcher,
        realtime: Arc<dyn EventPublisher>,
        domain_events: DomainEventPublisher,
    ) -> Self {
        Self {
            store,
            configs,
            dispatcher,
            realtime,
            domain_events,
        }
    }

    /// Persist a pending invoice for an order and publish the create request.
    ///
    /// Returns once the request is on the broker; the provider outcome is
    /// applied later by the response reconciler.
    #[instrument(skip(self, intent), fields(component = "create_path", order_id = %intent.order_id, trigger = intent.trigger.as_str()))]
    pub async fn create_invoice(
        &self,
        intent: CreateInvoiceIntent,
    ) -> Result<Invoice, InvoicingError> {
        let order = self
            .store
            .get_order(intent.order_id)
            .await?
            .filter(|o| intent.business_id.map_or(true, |b| o.business_id == b))
            .ok_or(InvoicingError::OrderNotFound(intent.order_id))?;

        if !order.invoiceable {
            return Err(InvoicingError::OrderNotInvoiceable(order.order_id));
        }

        let config = self
            .configs
            .get_by_source_integration(order.integration_id)
            .await?
            .ok_or(InvoicingError::ProviderNotConfigured(order.integration_id))?;
        if !config.enabled {
            return Err(InvoicingError::ConfigNotEnabled);
        }
        if intent.trigger == TriggerSource::Auto && !config.auto_invoice {
            return Err(InvoicingError::AutoInvoiceDisabled);
        }

        let target = intent
            .invoicing_integration_id
            .unwrap_or(config.invoicing_integration_id);
        if self
            .store
            .invoice_exists_for_order(order.order_id, target)
            .await?
        {
            return Err(InvoicingError::OrderAlreadyInvoiced(order.order_id));
        }

        if let Err(rejection) = filters::evaluate(&order, &config.filters) {
            FILTER_REJECTIONS_TOTAL
                .with_label_values(&[rejection.code()])
                .inc();
            info!(rule = rejection.code(), reason = %rejection, "Order rejected by filters");
            return Err(rejection.into());
        }

        let (new_invoice, new_items) = build_invoice(&order, &config, target, intent.trigger);
        let first_attempt = NewSyncLog {
            invoice_id: new_invoice.invoice_id,
            operation: SyncOperation::Create,
            status: SyncStatus::Processing,
            correlation_id: Uuid::new_v4(),
            request_url: None,
            request_payload: None,
            retry_count: 0,
            max_retries: config.max_retries,
            trigger: intent.trigger,
            user_id: intent.user_id,
        };
        let created = self
            .store
            .create_invoice_with_items(
                &new_invoice,
                &new_items,
                &first_attempt,
                intent.bulk_item_id,
            )
            .await?;
        INVOICES_TOTAL.with_label_values(&["pending"]).inc();
        info!(invoice_id = %created.invoice.invoice_id, total = %created.invoice.total_amount, "Invoice created");

        let request = invoice_request(
            &created.invoice,
            &created.items,
            SyncOperation::Create,
            config.invoice_config.clone(),
            created.attempt.correlation_id,
        );
        self.publish_attempt(&created.attempt, &request).await?;

        Ok(created.invoice)
    }

    /// Open a new attempt for a pending or failed invoice.
    pub async fn retry_invoice(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
        trigger: TriggerSource,
        user_id: Option<Uuid>,
    ) -> Result<SyncLog, InvoicingError> {
        let invoice = self.load_invoice(invoice_id, business_id).await?;
        self.retry_from(invoice, None, trigger, user_id).await
    }

    /// Retry driven by a claimed failed attempt. Skipped when a newer attempt
    /// has superseded the claimed one.
    pub async fn retry_claimed(&self, claimed: &SyncLog) -> Result<SyncLog, InvoicingError> {
        let invoice = self.load_invoice(claimed.invoice_id, None).await?;
        self.retry_from(invoice, Some(claimed.sync_log_id), TriggerSource::RetrySweep, None)
            .await
    }

    #[instrument(skip(self, invoice, user_id), fields(component = "retry_path", invoice_id = %invoice.invoice_id, trigger = trigger.as_str()))]
    async fn retry_from(
        &self,
        invoice: Invoice,
        expected_attempt: Option<Uuid>,
        trigger: TriggerSource,
        user_id: Option<Uuid>,
    ) -> Result<SyncLog, InvoicingError> {
        match invoice.status {
            InvoiceStatus::Issued | InvoiceStatus::Cancelled => {
                return Err(InvoicingError::RetryNotAllowed(format!(
                    "invoice is {}",
                    invoice.status.as_str()
                )));
            }
            InvoiceStatus::Draft | InvoiceStatus::Pending | InvoiceStatus::Failed => {}
        }

        let config = self.config_for_invoice(&invoice).await?;
        let latest = self.store.get_latest_sync_log(invoice.invoice_id).await?;

        if let (Some(expected), Some(latest)) = (expected_attempt, &latest) {
            if latest.sync_log_id != expected {
                return Err(InvoicingError::RetryNotAllowed(
                    "attempt was superseded".to_string(),
                ));
            }
        }

        let (retry_count, max_retries) = match &latest {
            Some(latest) if latest.status.is_open() => {
                return Err(InvoicingError::RetryNotAllowed(
                    "an attempt is already in progress".to_string(),
                ));
            }
            Some(latest) if !latest.can_retry() => {
                return Err(InvoicingError::MaxRetriesExceeded);
            }
            Some(latest) => (latest.retry_count + 1, latest.max_retries),
            None => (0, config.max_retries),
        };

        if invoice.status != InvoiceStatus::Pending {
            self.store
                .transition_invoice(
                    invoice.invoice_id,
                    &[InvoiceStatus::Draft, InvoiceStatus::Failed],
                    InvoiceStatus::Pending,
                )
                .await?;
        }

        let items = self.store.get_invoice_items(invoice.invoice_id).await?;
        let operation = if retry_count == 0 {
            SyncOperation::Create
        } else {
            SyncOperation::Retry
        };
        let attempt = self
            .send_attempt(
                &invoice,
                &items,
                &config,
                operation,
                retry_count,
                max_retries,
                trigger,
                user_id,
            )
            .await?;

        info!(sync_log_id = %attempt.sync_log_id, retry_count, "Retry dispatched");
        Ok(attempt)
    }

    /// Cancel an invoice. Issued invoices are voided through the provider;
    /// anything not yet issued is cancelled locally along with its retries.
    #[instrument(skip(self, user_id), fields(component = "cancel_path"))]
    pub async fn cancel_invoice(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
        user_id: Option<Uuid>,
    ) -> Result<CancelOutcome, InvoicingError> {
        let invoice = self.load_invoice(invoice_id, business_id).await?;

        match invoice.status {
            InvoiceStatus::Cancelled => Err(InvoicingError::InvoiceAlreadyCancelled),
            InvoiceStatus::Issued => {
                let config = self.config_for_invoice(&invoice).await?;
                let items = self.store.get_invoice_items(invoice_id).await?;
                let attempt = self
                    .send_attempt(
                        &invoice,
                        &items,
                        &config,
                        SyncOperation::Cancel,
                        0,
                        0,
                        TriggerSource::Manual,
                        user_id,
                    )
                    .await?;
                info!(sync_log_id = %attempt.sync_log_id, "Provider cancellation requested");
                Ok(CancelOutcome::Requested(attempt))
            }
            InvoiceStatus::Draft | InvoiceStatus::Pending | InvoiceStatus::Failed => {
                let cancelled = self
                    .store
                    .transition_invoice(
                        invoice_id,
                        &[
                            InvoiceStatus::Draft,
                            InvoiceStatus::Pending,
                            InvoiceStatus::Failed,
                        ],
                        InvoiceStatus::Cancelled,
                    )
                    .await?;
                if !cancelled {
                    // Lost a race with the reconciler; report the current state.
                    let current = self.load_invoice(invoice_id, business_id).await?;
                    return Err(match current.status {
                        InvoiceStatus::Issued => InvoicingError::InvoiceAlreadyIssued,
                        _ => InvoicingError::InvoiceAlreadyCancelled,
                    });
                }

                let retries = self.store.cancel_scheduled_retries(invoice_id).await?;
                let invoice = self.load_invoice(invoice_id, business_id).await?;
                INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
                info!(cancelled_retries = retries, "Invoice cancelled locally");

                self.announce_cancelled(&invoice).await;
                Ok(CancelOutcome::Cancelled(invoice))
            }
        }
    }

    /// Credit notes are issued by the invoicing integration itself.
    pub async fn create_credit_note(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<(), InvoicingError> {
        self.load_invoice(invoice_id, business_id).await?;
        Err(InvoicingError::CreditNoteDelegated)
    }

    pub async fn get_invoice(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<(Invoice, Vec<InvoiceItem>), InvoicingError> {
        let invoice = self.load_invoice(invoice_id, business_id).await?;
        let items = self.store.get_invoice_items(invoice_id).await?;
        Ok((invoice, items))
    }

    pub async fn list_invoices(
        &self,
        filter: &ListInvoicesFilter,
    ) -> Result<(Vec<Invoice>, i64), InvoicingError> {
        self.store.list_invoices(filter).await
    }

    /// Attempts for an invoice, oldest first.
    pub async fn sync_logs(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<Vec<SyncLog>, InvoicingError> {
        self.load_invoice(invoice_id, business_id).await?;
        self.store.get_sync_logs(invoice_id).await
    }

    pub async fn summary(
        &self,
        business_id: Option<Uuid>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<InvoiceSummary, InvoicingError> {
        check_window(start, end)?;
        self.store.invoice_summary(business_id, start, end).await
    }

    pub async fn stats(
        &self,
        business_id: Option<Uuid>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<InvoiceStats, InvoicingError> {
        let summary = self.summary(business_id, start, end).await?;
        let (pending_retries, exhausted_retries) = self.store.retry_backlog(business_id).await?;
        Ok(InvoiceStats {
            start_date: start,
            end_date: end,
            success_rate: InvoiceStats::success_rate(&summary),
            summary,
            pending_retries,
            exhausted_retries,
        })
    }

    /// One point per calendar day in `[start, end]`, zero-filled.
    pub async fn trends(
        &self,
        business_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TrendPoint>, InvoicingError> {
        check_window(Some(start), Some(end))?;
        if (end - start).num_days() > MAX_TREND_DAYS {
            return Err(InvoicingError::InvalidInput(format!(
                "trend window may not exceed {} days",
                MAX_TREND_DAYS
            )));
        }

        let points = self.store.invoice_trends(business_id, start, end).await?;
        let mut filled = Vec::new();
        let mut day = start;
        while day <= end {
            let point = points
                .iter()
                .find(|p| p.day == day)
                .cloned()
                .unwrap_or(TrendPoint {
                    day,
                    created: 0,
                    issued: 0,
                    failed: 0,
                    issued_amount: Default::default(),
                });
            filled.push(point);
            day += Duration::days(1);
        }
        Ok(filled)
    }

    pub(crate) async fn announce_cancelled(&self, invoice: &Invoice) {
        self.realtime.publish(RealtimeEvent::new(
            RealtimeEventType::InvoiceCancelled,
            invoice.business_id,
            invoice_payload(invoice),
        ));
        self.domain_events
            .emit("invoice.cancelled", invoice, invoice_payload(invoice))
            .await;
    }

    async fn load_invoice(
        &self,
        invoice_id: Uuid,
        business_id: Option<Uuid>,
    ) -> Result<Invoice, InvoicingError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .filter(|i| business_id.map_or(true, |b| i.business_id == b))
            .ok_or(InvoicingError::InvoiceNotFound(invoice_id))
    }

    /// The config that governs an existing invoice: the one attached to the
    /// order's source integration, else the business's enabled config.
    async fn config_for_invoice(
        &self,
        invoice: &Invoice,
    ) -> Result<InvoicingConfig, InvoicingError> {
        if let Some(order) = self.store.get_order(invoice.order_id).await? {
            if let Some(config) = self
                .configs
                .get_by_source_integration(order.integration_id)
                .await?
            {
                return Ok(config);
            }
        }
        self.configs
            .get_enabled_by_business(invoice.business_id)
            .await?
            .ok_or(InvoicingError::ProviderNotConfigured(
                invoice.invoicing_integration_id,
            ))
    }

    /// Record a processing attempt and publish its request.
    #[allow(clippy::too_many_arguments)]
    async fn send_attempt(
        &self,
        invoice: &Invoice,
        items: &[InvoiceItem],
        config: &InvoicingConfig,
        operation: SyncOperation,
        retry_count: i32,
        max_retries: i32,
        trigger: TriggerSource,
        user_id: Option<Uuid>,
    ) -> Result<SyncLog, InvoicingError> {
        let correlation_id = Uuid::new_v4();
        let request = invoice_request(
            invoice,
            items,
            operation,
            config.invoice_config.clone(),
            correlation_id,
        );

        let attempt = self
            .store
            .insert_sync_log(&NewSyncLog {
                invoice_id: invoice.invoice_id,
                operation,
                status: SyncStatus::Processing,
                correlation_id,
                request_url: None,
                request_payload: serde_json::to_value(&request).ok(),
                retry_count,
                max_retries,
                trigger,
                user_id,
            })
            .await?;

        self.publish_attempt(&attempt, &request).await?;
        Ok(attempt)
    }

    /// Publish the request of an open attempt. A publish failure closes the
    /// attempt as failed, which schedules the next retry.
    async fn publish_attempt(
        &self,
        attempt: &SyncLog,
        request: &InvoiceRequestMessage,
    ) -> Result<(), InvoicingError> {
        let Err(e) = self.dispatcher.dispatch(request).await else {
            return Ok(());
        };

        let completion = SyncLogCompletion::failure(
            attempt,
            e.to_string(),
            Some(PUBLISH_ERROR_CODE.to_string()),
            None,
            ProviderAudit {
                request_payload: serde_json::to_value(request).ok(),
                ..Default::default()
            },
        );
        match self
            .store
            .complete_sync_log(attempt.sync_log_id, &completion)
            .await
        {
            Ok(closed) => warn!(
                sync_log_id = %closed.sync_log_id,
                next_retry_utc = ?closed.next_retry_utc,
                "Attempt failed to publish"
            ),
            Err(store_err) => warn!(
                sync_log_id = %attempt.sync_log_id,
                error = %store_err,
                "Failed to record publish failure"
            ),
        }
        Err(e)
    }
}

/// Event payload describing an invoice's current state.
pub(crate) fn invoice_payload(invoice: &Invoice) -> serde_json::Value {
    json!({
        "invoice_id": invoice.invoice_id,
        "order_id": invoice.order_id,
        "status": invoice.status,
        "invoice_number": invoice.invoice_number,
        "cufe": invoice.cufe,
        "invoice_url": invoice.invoice_url,
        "pdf_url": invoice.pdf_url,
        "total_amount": invoice.total_amount,
        "currency": invoice.currency,
    })
}

fn check_window(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<(), InvoicingError> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(InvoicingError::InvalidDate(format!(
                "end date {} is before start date {}",
                end, start
            )));
        }
    }
    Ok(())
}

/// Snapshot the order into a new invoice aggregate.
fn build_invoice(
    order: &Order,
    config: &InvoicingConfig,
    target: Uuid,
    trigger: TriggerSource,
) -> (NewInvoice, Vec<NewInvoiceItem>) {
    let invoice = NewInvoice {
        invoice_id: Uuid::new_v4(),
        business_id: order.business_id,
        order_id: order.order_id,
        invoicing_integration_id: target,
        provider: config.provider.clone(),
        subtotal: order.subtotal,
        tax: order.tax,
        discount: order.discount,
        shipping_cost: order.shipping_cost,
        total_amount: order.total_amount,
        currency: order.currency.clone(),
        customer: CustomerSnapshot {
            name: order.customer.name.clone(),
            email: order.customer.email.clone(),
            phone: order.customer.phone.clone(),
            dni: order.customer.dni.clone(),
        },
        metadata: json!({
            "order_number": order.order_number,
            "source_integration_id": order.integration_id,
            "config_id": config.config_id,
            "trigger": trigger.as_str(),
        }),
    };

    let items = order
        .items
        .iter()
        .map(|item| NewInvoiceItem {
            product_id: item.product_id,
            sku: item.sku.clone(),
            name: item.name.clone(),
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price: item.total_price,
            currency: order.currency.clone(),
            tax: item.tax,
            tax_rate: item.tax_rate,
            discount: item.discount,
        })
        .collect();

    (invoice, items)
}
