//! In-process implementation of every repository trait.
//!
//! Enforces the same uniqueness and guarded transitions as the Postgres
//! schema. Used by the test suites and for running the service without a
//! database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    BulkCounterDelta, BulkItemStatus, BulkJob, BulkJobItem, BulkJobStatus, CompareRequest,
    CompareStatus, CreatedInvoice, Invoice, InvoiceItem, InvoiceStatus, InvoiceSummary,
    InvoicingConfig, IssuedInvoice, ListInvoicesFilter, NewInvoice, NewInvoiceItem,
    NewInvoicingConfig, NewSyncLog, Order, SyncLog, SyncLogCompletion, SyncStatus, TrendPoint,
};
use crate::services::repository::{
    BulkJobRepository, CompareRepository, ConfigRepository, InvoiceRepository, InvoicingStore,
    OrderRepository, StoreResult, SyncLogRepository,
};

#[derive(Default)]
struct State {
    configs: HashMap<Uuid, InvoicingConfig>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_items: HashMap<Uuid, Vec<InvoiceItem>>,
    sync_logs: Vec<SyncLog>,
    bulk_jobs: HashMap<Uuid, BulkJob>,
    bulk_items: Vec<BulkJobItem>,
    orders: HashMap<Uuid, Order>,
    compares: HashMap<Uuid, CompareRequest>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    faults: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a database error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next call of a named write (`create_invoice_with_items`,
    /// `insert_sync_log`, `complete_sync_log`) with a database error.
    pub fn fail_next(&self, operation: &'static str) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        *faults.entry(operation).or_insert(0) += 1;
    }

    /// Seed or replace an order in the read model. Seeding ignores the
    /// outage flag.
    pub fn put_order(&self, order: Order) {
        self.seed().orders.insert(order.order_id, order);
    }

    /// Seed an invoice directly, bypassing the create path.
    pub fn put_invoice(&self, invoice: Invoice, items: Vec<InvoiceItem>) {
        let mut state = self.seed();
        state.invoice_items.insert(invoice.invoice_id, items);
        state.invoices.insert(invoice.invoice_id, invoice);
    }

    /// Move every scheduled retry of an invoice to `at`.
    pub fn reschedule_retries(&self, invoice_id: Uuid, at: DateTime<Utc>) {
        for log in self
            .seed()
            .sync_logs
            .iter_mut()
            .filter(|l| l.invoice_id == invoice_id && l.next_retry_utc.is_some())
        {
            log.next_retry_utc = Some(at);
        }
    }

    fn seed(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock for a write that may have a fault queued against it.
    fn lock_write(&self, operation: &'static str) -> StoreResult<MutexGuard<'_, State>> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = faults.get_mut(operation).filter(|n| **n > 0) {
            *pending -= 1;
            return Err(InvoicingError::Infrastructure(AppError::DatabaseError(
                anyhow::anyhow!("injected failure in {}", operation),
            )));
        }
        drop(faults);
        self.lock()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InvoicingError::Infrastructure(AppError::DatabaseError(
                anyhow::anyhow!("store unavailable"),
            )));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn in_window(created: DateTime<Utc>, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    let day = created.date_naive();
    start.map_or(true, |s| day >= s) && end.map_or(true, |e| day <= e)
}

fn sync_log_row(input: &NewSyncLog) -> SyncLog {
    let now = Utc::now();
    SyncLog {
        sync_log_id: Uuid::new_v4(),
        invoice_id: input.invoice_id,
        operation: input.operation,
        status: input.status,
        correlation_id: input.correlation_id,
        request_url: input.request_url.clone(),
        request_payload: input.request_payload.clone(),
        response_status: None,
        response_body: None,
        error_message: None,
        error_code: None,
        error_details: None,
        retry_count: input.retry_count,
        max_retries: input.max_retries,
        next_retry_utc: None,
        retried_utc: None,
        trigger: input.trigger,
        user_id: input.user_id,
        started_utc: now,
        completed_utc: None,
        duration_ms: None,
        created_utc: now,
    }
}

#[async_trait]
impl ConfigRepository for MemoryStore {
    async fn insert_config(&self, input: &NewInvoicingConfig) -> StoreResult<InvoicingConfig> {
        let mut state = self.lock()?;

        if state
            .configs
            .values()
            .any(|c| c.source_integration_id == input.source_integration_id)
        {
            return Err(InvoicingError::ConfigAlreadyExists);
        }
        if input.enabled
            && state
                .configs
                .values()
                .any(|c| c.business_id == input.business_id && c.enabled)
        {
            return Err(InvoicingError::ActiveInvoicingConfigExists);
        }

        let now = Utc::now();
        let config = InvoicingConfig {
            config_id: Uuid::new_v4(),
            business_id: input.business_id,
            source_integration_id: input.source_integration_id,
            invoicing_integration_id: input.invoicing_integration_id,
            provider: input.provider.clone(),
            enabled: input.enabled,
            auto_invoice: input.auto_invoice,
            filters: input.filters.clone(),
            invoice_config: input.invoice_config.clone(),
            description: input.description.clone(),
            max_retries: input.max_retries,
            created_by: input.created_by,
            created_utc: now,
            updated_utc: now,
        };
        state.configs.insert(config.config_id, config.clone());
        Ok(config)
    }

    async fn save_config(&self, config: &InvoicingConfig) -> StoreResult<InvoicingConfig> {
        let mut state = self.lock()?;

        if !state.configs.contains_key(&config.config_id) {
            return Err(InvoicingError::ConfigNotFound);
        }
        if config.enabled
            && state.configs.values().any(|c| {
                c.config_id != config.config_id && c.business_id == config.business_id && c.enabled
            })
        {
            return Err(InvoicingError::ActiveInvoicingConfigExists);
        }

        let mut saved = config.clone();
        saved.updated_utc = Utc::now();
        state.configs.insert(saved.config_id, saved.clone());
        Ok(saved)
    }

    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<InvoicingConfig>> {
        Ok(self.lock()?.configs.get(&config_id).cloned())
    }

    async fn get_config_by_source_integration(
        &self,
        integration_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>> {
        Ok(self
            .lock()?
            .configs
            .values()
            .find(|c| c.source_integration_id == integration_id)
            .cloned())
    }

    async fn get_enabled_config_by_business(
        &self,
        business_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>> {
        Ok(self
            .lock()?
            .configs
            .values()
            .find(|c| c.business_id == business_id && c.enabled)
            .cloned())
    }

    async fn list_configs(&self, business_id: Option<Uuid>) -> StoreResult<Vec<InvoicingConfig>> {
        let state = self.lock()?;
        let mut configs: Vec<_> = state
            .configs
            .values()
            .filter(|c| business_id.map_or(true, |b| c.business_id == b))
            .cloned()
            .collect();
        configs.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(configs)
    }

    async fn list_enabled_configs(&self) -> StoreResult<Vec<InvoicingConfig>> {
        Ok(self
            .lock()?
            .configs
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn delete_config(&self, config_id: Uuid) -> StoreResult<bool> {
        Ok(self.lock()?.configs.remove(&config_id).is_some())
    }
}

#[async_trait]
impl InvoiceRepository for MemoryStore {
    async fn create_invoice_with_items(
        &self,
        input: &NewInvoice,
        items: &[NewInvoiceItem],
        first_attempt: &NewSyncLog,
        bulk_item_id: Option<Uuid>,
    ) -> StoreResult<CreatedInvoice> {
        let mut state = self.lock_write("create_invoice_with_items")?;

        if state.invoices.values().any(|i| {
            i.order_id == input.order_id
                && i.invoicing_integration_id == input.invoicing_integration_id
        }) {
            return Err(InvoicingError::OrderAlreadyInvoiced(input.order_id));
        }

        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: input.invoice_id,
            business_id: input.business_id,
            order_id: input.order_id,
            invoicing_integration_id: input.invoicing_integration_id,
            provider: input.provider.clone(),
            subtotal: input.subtotal,
            tax: input.tax,
            discount: input.discount,
            shipping_cost: input.shipping_cost,
            total_amount: input.total_amount,
            currency: input.currency.clone(),
            customer: input.customer.clone(),
            status: InvoiceStatus::Pending,
            external_id: None,
            invoice_number: None,
            invoice_url: None,
            pdf_url: None,
            xml_url: None,
            cufe: None,
            provider_response: None,
            metadata: input.metadata.clone(),
            created_utc: now,
            updated_utc: now,
            issued_utc: None,
            cancelled_utc: None,
            expires_utc: None,
        };
        let lines: Vec<InvoiceItem> = items
            .iter()
            .map(|item| InvoiceItem {
                item_id: Uuid::new_v4(),
                invoice_id: invoice.invoice_id,
                product_id: item.product_id,
                sku: item.sku.clone(),
                name: item.name.clone(),
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                total_price: item.total_price,
                currency: item.currency.clone(),
                tax: item.tax,
                tax_rate: item.tax_rate,
                discount: item.discount,
            })
            .collect();

        let attempt = sync_log_row(&NewSyncLog {
            invoice_id: invoice.invoice_id,
            ..first_attempt.clone()
        });

        if let Some(item) = bulk_item_id.and_then(|id| {
            state
                .bulk_items
                .iter_mut()
                .find(|i| i.item_id == id && i.status == BulkItemStatus::Processing)
        }) {
            item.invoice_id = Some(invoice.invoice_id);
        }

        state.sync_logs.push(attempt.clone());
        state.invoice_items.insert(invoice.invoice_id, lines.clone());
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(CreatedInvoice {
            invoice,
            items: lines,
            attempt,
        })
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<Invoice>> {
        Ok(self.lock()?.invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceItem>> {
        Ok(self
            .lock()?
            .invoice_items
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_invoices_by_order(&self, order_id: Uuid) -> StoreResult<Vec<Invoice>> {
        let state = self.lock()?;
        let mut invoices: Vec<_> = state
            .invoices
            .values()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_utc);
        Ok(invoices)
    }

    async fn get_invoice_by_order_and_provider(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<Option<Invoice>> {
        Ok(self
            .lock()?
            .invoices
            .values()
            .find(|i| i.order_id == order_id && i.invoicing_integration_id == integration_id)
            .cloned())
    }

    async fn invoice_exists_for_order(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<bool> {
        Ok(self
            .get_invoice_by_order_and_provider(order_id, integration_id)
            .await?
            .is_some())
    }

    async fn update_invoice(&self, invoice: &Invoice) -> StoreResult<Invoice> {
        let mut state = self.lock()?;
        let stored = state
            .invoices
            .get_mut(&invoice.invoice_id)
            .ok_or(InvoicingError::InvoiceNotFound(invoice.invoice_id))?;
        *stored = invoice.clone();
        stored.updated_utc = Utc::now();
        Ok(stored.clone())
    }

    async fn mark_invoice_issued(
        &self,
        invoice_id: Uuid,
        issued: &IssuedInvoice,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(invoice) = state.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if matches!(invoice.status, InvoiceStatus::Issued | InvoiceStatus::Cancelled) {
            return Ok(false);
        }
        invoice.status = InvoiceStatus::Issued;
        invoice.external_id = issued.external_id.clone();
        invoice.invoice_number = issued.invoice_number.clone();
        invoice.invoice_url = issued.invoice_url.clone();
        invoice.pdf_url = issued.pdf_url.clone();
        invoice.xml_url = issued.xml_url.clone();
        invoice.cufe = issued.cufe.clone();
        invoice.issued_utc = Some(issued.issued_utc);
        invoice.provider_response = issued.provider_response.clone();
        invoice.updated_utc = Utc::now();
        Ok(true)
    }

    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        from: &[InvoiceStatus],
        to: InvoiceStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(invoice) = state.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if !from.contains(&invoice.status) {
            return Ok(false);
        }
        invoice.status = to;
        invoice.updated_utc = Utc::now();
        if to == InvoiceStatus::Cancelled {
            invoice.cancelled_utc = Some(invoice.updated_utc);
        }
        Ok(true)
    }

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> StoreResult<(Vec<Invoice>, i64)> {
        let state = self.lock()?;
        let mut matching: Vec<_> = state
            .invoices
            .values()
            .filter(|i| filter.business_id.map_or(true, |b| i.business_id == b))
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .filter(|i| filter.order_id.map_or(true, |o| i.order_id == o))
            .filter(|i| in_window(i.created_utc, filter.start_date, filter.end_date))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect();
        Ok((page, total))
    }

    async fn get_issued_in_range(
        &self,
        business_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Invoice>> {
        let state = self.lock()?;
        let mut issued: Vec<_> = state
            .invoices
            .values()
            .filter(|i| {
                i.business_id == business_id
                    && i.status == InvoiceStatus::Issued
                    && i.created_utc >= from
                    && i.created_utc <= to
            })
            .cloned()
            .collect();
        issued.sort_by(|a, b| a.invoice_number.cmp(&b.invoice_number));
        Ok(issued)
    }

    async fn invoice_summary(
        &self,
        business_id: Option<Uuid>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<InvoiceSummary> {
        let state = self.lock()?;
        let mut summary = InvoiceSummary::default();
        for invoice in state
            .invoices
            .values()
            .filter(|i| business_id.map_or(true, |b| i.business_id == b))
            .filter(|i| in_window(i.created_utc, start, end))
        {
            summary.total += 1;
            match invoice.status {
                InvoiceStatus::Draft => summary.draft += 1,
                InvoiceStatus::Pending => summary.pending += 1,
                InvoiceStatus::Issued => {
                    summary.issued += 1;
                    summary.issued_amount += invoice.total_amount;
                }
                InvoiceStatus::Failed => summary.failed += 1,
                InvoiceStatus::Cancelled => summary.cancelled += 1,
            }
        }
        Ok(summary)
    }

    async fn invoice_trends(
        &self,
        business_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<TrendPoint>> {
        let state = self.lock()?;
        let mut days: BTreeMap<NaiveDate, TrendPoint> = BTreeMap::new();
        for invoice in state
            .invoices
            .values()
            .filter(|i| business_id.map_or(true, |b| i.business_id == b))
            .filter(|i| in_window(i.created_utc, Some(start), Some(end)))
        {
            let day = invoice.created_utc.date_naive();
            let point = days.entry(day).or_insert_with(|| TrendPoint {
                day,
                created: 0,
                issued: 0,
                failed: 0,
                issued_amount: Default::default(),
            });
            point.created += 1;
            match invoice.status {
                InvoiceStatus::Issued => {
                    point.issued += 1;
                    point.issued_amount += invoice.total_amount;
                }
                InvoiceStatus::Failed => point.failed += 1,
                _ => {}
            }
        }
        Ok(days.into_values().collect())
    }
}

#[async_trait]
impl SyncLogRepository for MemoryStore {
    async fn insert_sync_log(&self, input: &NewSyncLog) -> StoreResult<SyncLog> {
        let mut state = self.lock_write("insert_sync_log")?;
        let log = sync_log_row(input);
        state.sync_logs.push(log.clone());
        Ok(log)
    }

    async fn get_sync_logs(&self, invoice_id: Uuid) -> StoreResult<Vec<SyncLog>> {
        Ok(self
            .lock()?
            .sync_logs
            .iter()
            .filter(|l| l.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn get_latest_sync_log(&self, invoice_id: Uuid) -> StoreResult<Option<SyncLog>> {
        Ok(self
            .lock()?
            .sync_logs
            .iter()
            .rev()
            .find(|l| l.invoice_id == invoice_id)
            .cloned())
    }

    async fn get_sync_log_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<Option<SyncLog>> {
        Ok(self
            .lock()?
            .sync_logs
            .iter()
            .find(|l| l.correlation_id == correlation_id)
            .cloned())
    }

    async fn complete_sync_log(
        &self,
        sync_log_id: Uuid,
        completion: &SyncLogCompletion,
    ) -> StoreResult<SyncLog> {
        let mut state = self.lock_write("complete_sync_log")?;
        let log = state
            .sync_logs
            .iter_mut()
            .find(|l| l.sync_log_id == sync_log_id)
            .ok_or_else(|| {
                InvoicingError::Infrastructure(AppError::NotFound(anyhow::anyhow!(
                    "sync log {} vanished",
                    sync_log_id
                )))
            })?;

        log.status = completion.status;
        log.error_message = completion.error_message.clone();
        log.error_code = completion.error_code.clone();
        log.error_details = completion.error_details.clone();
        log.next_retry_utc = completion.next_retry_utc;
        if completion.audit.request_url.is_some() {
            log.request_url = completion.audit.request_url.clone();
        }
        if completion.audit.request_payload.is_some() {
            log.request_payload = completion.audit.request_payload.clone();
        }
        log.response_status = completion.audit.response_status;
        log.response_body = completion.audit.response_body.clone();
        log.completed_utc = Some(completion.completed_utc);
        log.duration_ms = Some(completion.duration_ms);
        Ok(log.clone())
    }

    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<SyncLog>> {
        let mut state = self.lock()?;
        let mut due: Vec<&mut SyncLog> = state
            .sync_logs
            .iter_mut()
            .filter(|l| {
                l.status == SyncStatus::Failed
                    && l.retry_count < l.max_retries
                    && l.retried_utc.is_none()
                    && l.next_retry_utc.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|l| l.next_retry_utc);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|l| {
                l.retried_utc = Some(now);
                l.clone()
            })
            .collect())
    }

    async fn release_retry_claim(&self, sync_log_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(log) = state
            .sync_logs
            .iter_mut()
            .find(|l| l.sync_log_id == sync_log_id && l.status == SyncStatus::Failed)
        {
            log.retried_utc = None;
        }
        Ok(())
    }

    async fn cancel_scheduled_retries(&self, invoice_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let mut cancelled = 0;
        for log in state.sync_logs.iter_mut().filter(|l| {
            l.invoice_id == invoice_id
                && l.retried_utc.is_none()
                && (l.status.is_open()
                    || (l.status == SyncStatus::Failed && l.next_retry_utc.is_some()))
        }) {
            log.status = SyncStatus::Cancelled;
            log.next_retry_utc = None;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn retry_backlog(&self, business_id: Option<Uuid>) -> StoreResult<(i64, i64)> {
        let state = self.lock()?;
        let mut scheduled = 0;
        let mut exhausted = 0;
        for log in state.sync_logs.iter().filter(|l| l.status == SyncStatus::Failed) {
            let Some(invoice) = state.invoices.get(&log.invoice_id) else {
                continue;
            };
            if business_id.is_some_and(|b| invoice.business_id != b) {
                continue;
            }
            if log.next_retry_utc.is_some() && log.retried_utc.is_none() {
                scheduled += 1;
            }
            if log.retry_count >= log.max_retries && invoice.status == InvoiceStatus::Failed {
                exhausted += 1;
            }
        }
        Ok((scheduled, exhausted))
    }
}

#[async_trait]
impl BulkJobRepository for MemoryStore {
    async fn create_bulk_job(
        &self,
        business_id: Uuid,
        created_by: Option<Uuid>,
        order_ids: &[Uuid],
    ) -> StoreResult<(BulkJob, Vec<BulkJobItem>)> {
        let mut state = self.lock()?;

        let mut seen = std::collections::HashSet::new();
        if !order_ids.iter().all(|id| seen.insert(*id)) {
            return Err(InvoicingError::InvalidInput(
                "order ids must be unique".to_string(),
            ));
        }

        let job = BulkJob {
            job_id: Uuid::new_v4(),
            business_id,
            created_by,
            total_orders: order_ids.len() as i32,
            processed: 0,
            successful: 0,
            failed: 0,
            status: BulkJobStatus::Pending,
            error_message: None,
            created_utc: Utc::now(),
            started_utc: None,
            completed_utc: None,
        };
        let items: Vec<BulkJobItem> = order_ids
            .iter()
            .map(|order_id| BulkJobItem {
                item_id: Uuid::new_v4(),
                job_id: job.job_id,
                order_id: *order_id,
                invoice_id: None,
                status: BulkItemStatus::Pending,
                error_message: None,
                processed_utc: None,
            })
            .collect();

        state.bulk_jobs.insert(job.job_id, job.clone());
        state.bulk_items.extend(items.iter().cloned());
        Ok((job, items))
    }

    async fn get_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>> {
        Ok(self.lock()?.bulk_jobs.get(&job_id).cloned())
    }

    async fn list_bulk_jobs(
        &self,
        business_id: Option<Uuid>,
        page: i64,
        page_size: i64,
    ) -> StoreResult<(Vec<BulkJob>, i64)> {
        let state = self.lock()?;
        let mut jobs: Vec<_> = state
            .bulk_jobs
            .values()
            .filter(|j| business_id.map_or(true, |b| j.business_id == b))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));

        let limit = page_size.clamp(1, 100);
        let offset = (page.max(1) - 1) * limit;
        let total = jobs.len() as i64;
        Ok((
            jobs.into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
            total,
        ))
    }

    async fn get_bulk_job_items(&self, job_id: Uuid) -> StoreResult<Vec<BulkJobItem>> {
        Ok(self
            .lock()?
            .bulk_items
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_bulk_item(&self, job_id: Uuid, order_id: Uuid) -> StoreResult<Option<BulkJobItem>> {
        Ok(self
            .lock()?
            .bulk_items
            .iter()
            .find(|i| i.job_id == job_id && i.order_id == order_id)
            .cloned())
    }

    async fn get_bulk_item_by_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<BulkJobItem>> {
        Ok(self
            .lock()?
            .bulk_items
            .iter()
            .rev()
            .find(|i| i.invoice_id == Some(invoice_id))
            .cloned())
    }

    async fn mark_bulk_job_processing(&self, job_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.bulk_jobs.get_mut(&job_id) {
            Some(job) if job.status == BulkJobStatus::Pending => {
                job.status = BulkJobStatus::Processing;
                job.started_utc.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_bulk_item(
        &self,
        item_id: Uuid,
        from: &[BulkItemStatus],
        to: BulkItemStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(item) = state
            .bulk_items
            .iter_mut()
            .find(|i| i.item_id == item_id && from.contains(&i.status))
        else {
            return Ok(false);
        };
        item.status = to;
        if invoice_id.is_some() {
            item.invoice_id = invoice_id;
        }
        if error_message.is_some() {
            item.error_message = error_message;
        }
        if to.is_terminal() {
            item.processed_utc = Some(Utc::now());
        }
        Ok(true)
    }

    async fn increment_bulk_counters(
        &self,
        job_id: Uuid,
        delta: BulkCounterDelta,
    ) -> StoreResult<BulkJob> {
        let mut state = self.lock()?;
        let job = state
            .bulk_jobs
            .get_mut(&job_id)
            .ok_or(InvoicingError::BulkJobNotFound(job_id))?;
        job.processed = (job.processed + delta.processed).min(job.total_orders);
        job.successful += delta.successful;
        job.failed += delta.failed;
        Ok(job.clone())
    }

    async fn complete_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>> {
        let mut state = self.lock()?;
        match state.bulk_jobs.get_mut(&job_id) {
            Some(job) if job.status != BulkJobStatus::Completed && job.is_settled() => {
                job.status = BulkJobStatus::Completed;
                job.completed_utc = Some(Utc::now());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.lock()?.orders.get(&order_id).cloned())
    }

    async fn record_order_invoice(
        &self,
        order_id: Uuid,
        invoice_number: Option<&str>,
        invoice_url: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.invoice_number = invoice_number.map(str::to_string);
            order.invoice_url = invoice_url.map(str::to_string);
        }
        Ok(())
    }
}

#[async_trait]
impl CompareRepository for MemoryStore {
    async fn insert_compare_request(&self, request: &CompareRequest) -> StoreResult<()> {
        self.lock()?
            .compares
            .insert(request.correlation_id, request.clone());
        Ok(())
    }

    async fn get_compare_request(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<Option<CompareRequest>> {
        Ok(self.lock()?.compares.get(&correlation_id).cloned())
    }

    async fn complete_compare_request(&self, correlation_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.compares.get_mut(&correlation_id) {
            Some(request) if request.status == CompareStatus::Pending => {
                request.status = CompareStatus::Completed;
                request.completed_utc = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl InvoicingStore for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CustomerSnapshot, FilterSet, PaymentStatus, ProviderConfig, SyncOperation, TriggerSource,
    };
    use rust_decimal::Decimal;

    fn new_invoice(order_id: Uuid, integration_id: Uuid) -> NewInvoice {
        NewInvoice {
            invoice_id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            order_id,
            invoicing_integration_id: integration_id,
            provider: "softpymes".into(),
            subtotal: Decimal::new(100, 0),
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            total_amount: Decimal::new(100, 0),
            currency: "COP".into(),
            customer: CustomerSnapshot::default(),
            metadata: serde_json::json!({}),
        }
    }

    fn first_attempt() -> NewSyncLog {
        NewSyncLog {
            invoice_id: Uuid::nil(),
            operation: SyncOperation::Create,
            status: SyncStatus::Processing,
            correlation_id: Uuid::new_v4(),
            request_url: None,
            request_payload: None,
            retry_count: 0,
            max_retries: 3,
            trigger: TriggerSource::Auto,
            user_id: None,
        }
    }

    fn new_config(business_id: Uuid, enabled: bool) -> NewInvoicingConfig {
        NewInvoicingConfig {
            business_id,
            source_integration_id: Uuid::new_v4(),
            invoicing_integration_id: Uuid::new_v4(),
            provider: "softpymes".into(),
            enabled,
            auto_invoice: true,
            filters: FilterSet::default(),
            invoice_config: ProviderConfig::default(),
            description: None,
            max_retries: 3,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn second_invoice_for_same_order_and_provider_conflicts() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        let integration_id = Uuid::new_v4();

        store
            .create_invoice_with_items(
                &new_invoice(order_id, integration_id),
                &[],
                &first_attempt(),
                None,
            )
            .await
            .unwrap();
        let err = store
            .create_invoice_with_items(
                &new_invoice(order_id, integration_id),
                &[],
                &first_attempt(),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvoicingError::OrderAlreadyInvoiced(id) if id == order_id));
        // A different provider integration is a separate slot.
        assert!(store
            .create_invoice_with_items(
                &new_invoice(order_id, Uuid::new_v4()),
                &[],
                &first_attempt(),
                None,
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn invoice_and_first_attempt_are_written_together() {
        let store = MemoryStore::new();
        let input = new_invoice(Uuid::new_v4(), Uuid::new_v4());

        store.fail_next("create_invoice_with_items");
        let err = store
            .create_invoice_with_items(&input, &[], &first_attempt(), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.get_invoice(input.invoice_id).await.unwrap().is_none());
        assert!(store.get_sync_logs(input.invoice_id).await.unwrap().is_empty());

        let created = store
            .create_invoice_with_items(&input, &[], &first_attempt(), None)
            .await
            .unwrap();
        assert_eq!(created.invoice.invoice_id, input.invoice_id);
        assert_eq!(created.attempt.invoice_id, input.invoice_id);
        assert_eq!(created.attempt.status, SyncStatus::Processing);
        assert_eq!(store.get_sync_logs(input.invoice_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seeding_ignores_outage_flag() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        store.set_unavailable(true);
        store.put_order(Order {
            order_id,
            business_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            order_number: "ORD-1".into(),
            subtotal: Decimal::new(100, 0),
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            total_amount: Decimal::new(100, 0),
            currency: "COP".into(),
            payment_status: PaymentStatus::Paid,
            payment_method_id: None,
            order_type: None,
            status: "paid".into(),
            customer: Default::default(),
            shipping_region: None,
            invoiceable: true,
            items: Vec::new(),
            created_utc: Utc::now(),
            invoice_number: None,
            invoice_url: None,
        });
        assert!(store.get_order(order_id).await.is_err());

        store.set_unavailable(false);
        assert!(store.get_order(order_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn only_one_enabled_config_per_business() {
        let store = MemoryStore::new();
        let business_id = Uuid::new_v4();

        store.insert_config(&new_config(business_id, true)).await.unwrap();
        let err = store
            .insert_config(&new_config(business_id, true))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoicingError::ActiveInvoicingConfigExists));

        assert!(store.insert_config(&new_config(business_id, false)).await.is_ok());
    }

    #[tokio::test]
    async fn claimed_retries_are_not_returned_twice() {
        let store = MemoryStore::new();
        let log = store
            .insert_sync_log(&NewSyncLog {
                invoice_id: Uuid::new_v4(),
                operation: SyncOperation::Create,
                status: SyncStatus::Processing,
                correlation_id: Uuid::new_v4(),
                request_url: None,
                request_payload: None,
                retry_count: 0,
                max_retries: 3,
                trigger: TriggerSource::Auto,
                user_id: None,
            })
            .await
            .unwrap();
        let completion = SyncLogCompletion::failure(
            &log,
            "boom",
            None,
            None,
            Default::default(),
        );
        store.complete_sync_log(log.sync_log_id, &completion).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(6);
        assert_eq!(store.claim_due_retries(later, 50).await.unwrap().len(), 1);
        assert!(store.claim_due_retries(later, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bulk_completion_transitions_once() {
        let store = MemoryStore::new();
        let (job, _) = store
            .create_bulk_job(Uuid::new_v4(), None, &[Uuid::new_v4()])
            .await
            .unwrap();

        assert!(store.complete_bulk_job(job.job_id).await.unwrap().is_none());
        store
            .increment_bulk_counters(job.job_id, BulkCounterDelta::failed_before_dispatch())
            .await
            .unwrap();
        assert!(store.complete_bulk_job(job.job_id).await.unwrap().is_some());
        assert!(store.complete_bulk_job(job.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_store_reports_transient_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_invoice(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
