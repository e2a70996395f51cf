//! Storage seams for the invoicing core.
//!
//! [`Database`](super::Database) implements these against Postgres and
//! [`MemoryStore`](super::MemoryStore) in process. Services depend on
//! `Arc<dyn InvoicingStore>`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    BulkCounterDelta, BulkItemStatus, BulkJob, BulkJobItem, CompareRequest, CreatedInvoice,
    Invoice, InvoiceItem, InvoiceStatus, InvoiceSummary, InvoicingConfig, IssuedInvoice,
    ListInvoicesFilter, NewInvoice, NewInvoiceItem, NewInvoicingConfig, NewSyncLog, Order,
    SyncLog, SyncLogCompletion, TrendPoint,
};

pub type StoreResult<T> = Result<T, InvoicingError>;

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Insert a config. Unique violations surface as
    /// `ActiveInvoicingConfigExists` or `ConfigAlreadyExists`.
    async fn insert_config(&self, input: &NewInvoicingConfig) -> StoreResult<InvoicingConfig>;

    /// Overwrite every mutable field of an existing config.
    async fn save_config(&self, config: &InvoicingConfig) -> StoreResult<InvoicingConfig>;

    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<InvoicingConfig>>;

    async fn get_config_by_source_integration(
        &self,
        integration_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>>;

    async fn get_enabled_config_by_business(
        &self,
        business_id: Uuid,
    ) -> StoreResult<Option<InvoicingConfig>>;

    async fn list_configs(&self, business_id: Option<Uuid>) -> StoreResult<Vec<InvoicingConfig>>;

    async fn list_enabled_configs(&self) -> StoreResult<Vec<InvoicingConfig>>;

    /// Soft delete. Returns false when no live row matched.
    async fn delete_config(&self, config_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Insert an invoice, its lines and its first attempt in one transaction,
    /// linking `bulk_item_id` to the invoice when it is still processing. A
    /// live invoice for the same (order, integration) surfaces as
    /// `OrderAlreadyInvoiced`.
    async fn create_invoice_with_items(
        &self,
        invoice: &NewInvoice,
        items: &[NewInvoiceItem],
        first_attempt: &NewSyncLog,
        bulk_item_id: Option<Uuid>,
    ) -> StoreResult<CreatedInvoice>;

    async fn get_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<Invoice>>;

    async fn get_invoice_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceItem>>;

    async fn get_invoices_by_order(&self, order_id: Uuid) -> StoreResult<Vec<Invoice>>;

    async fn get_invoice_by_order_and_provider(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<Option<Invoice>>;

    async fn invoice_exists_for_order(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<bool>;

    /// Overwrite status, provider fields and metadata.
    async fn update_invoice(&self, invoice: &Invoice) -> StoreResult<Invoice>;

    /// Move to issued unless already issued or cancelled. Returns whether the
    /// row transitioned.
    async fn mark_invoice_issued(
        &self,
        invoice_id: Uuid,
        issued: &IssuedInvoice,
    ) -> StoreResult<bool>;

    /// Set a status, only from one of `from`.
    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        from: &[InvoiceStatus],
        to: InvoiceStatus,
    ) -> StoreResult<bool>;

    /// Page of invoices plus the total matching count.
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> StoreResult<(Vec<Invoice>, i64)>;

    /// Issued invoices of a business created inside `[from, to]`.
    async fn get_issued_in_range(
        &self,
        business_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Invoice>>;

    async fn invoice_summary(
        &self,
        business_id: Option<Uuid>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<InvoiceSummary>;

    async fn invoice_trends(
        &self,
        business_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<TrendPoint>>;
}

#[async_trait]
pub trait SyncLogRepository: Send + Sync {
    async fn insert_sync_log(&self, input: &NewSyncLog) -> StoreResult<SyncLog>;

    /// Attempts of one invoice, oldest first.
    async fn get_sync_logs(&self, invoice_id: Uuid) -> StoreResult<Vec<SyncLog>>;

    async fn get_latest_sync_log(&self, invoice_id: Uuid) -> StoreResult<Option<SyncLog>>;

    async fn get_sync_log_by_correlation(&self, correlation_id: Uuid)
        -> StoreResult<Option<SyncLog>>;

    async fn complete_sync_log(
        &self,
        sync_log_id: Uuid,
        completion: &SyncLogCompletion,
    ) -> StoreResult<SyncLog>;

    /// Claim up to `limit` failed attempts whose retry is due. A claimed
    /// attempt is never returned again.
    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<SyncLog>>;

    /// Undo a claim so a later sweep can pick the attempt up again.
    async fn release_retry_claim(&self, sync_log_id: Uuid) -> StoreResult<()>;

    /// Cancel every scheduled retry of an invoice. Returns the affected count.
    async fn cancel_scheduled_retries(&self, invoice_id: Uuid) -> StoreResult<u64>;

    /// (scheduled retries, exhausted attempts) for the stats view.
    async fn retry_backlog(&self, business_id: Option<Uuid>) -> StoreResult<(i64, i64)>;
}

#[async_trait]
pub trait BulkJobRepository: Send + Sync {
    /// Insert the job and one pending item per order.
    async fn create_bulk_job(
        &self,
        business_id: Uuid,
        created_by: Option<Uuid>,
        order_ids: &[Uuid],
    ) -> StoreResult<(BulkJob, Vec<BulkJobItem>)>;

    async fn get_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>>;

    async fn list_bulk_jobs(
        &self,
        business_id: Option<Uuid>,
        page: i64,
        page_size: i64,
    ) -> StoreResult<(Vec<BulkJob>, i64)>;

    async fn get_bulk_job_items(&self, job_id: Uuid) -> StoreResult<Vec<BulkJobItem>>;

    async fn get_bulk_item(&self, job_id: Uuid, order_id: Uuid) -> StoreResult<Option<BulkJobItem>>;

    async fn get_bulk_item_by_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<BulkJobItem>>;

    /// pending -> processing. Returns whether the job transitioned.
    async fn mark_bulk_job_processing(&self, job_id: Uuid) -> StoreResult<bool>;

    /// Move an item to `to` only from one of `from`.
    async fn transition_bulk_item(
        &self,
        item_id: Uuid,
        from: &[BulkItemStatus],
        to: BulkItemStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> StoreResult<bool>;

    /// Atomically add `delta` to the job counters and return the new row.
    async fn increment_bulk_counters(
        &self,
        job_id: Uuid,
        delta: BulkCounterDelta,
    ) -> StoreResult<BulkJob>;

    /// Mark completed when every order has an outcome. Returns the job only
    /// for the caller that performed the transition.
    async fn complete_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;

    async fn record_order_invoice(
        &self,
        order_id: Uuid,
        invoice_number: Option<&str>,
        invoice_url: Option<&str>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait CompareRepository: Send + Sync {
    async fn insert_compare_request(&self, request: &CompareRequest) -> StoreResult<()>;

    async fn get_compare_request(&self, correlation_id: Uuid)
        -> StoreResult<Option<CompareRequest>>;

    /// pending -> completed. Returns whether the request transitioned.
    async fn complete_compare_request(&self, correlation_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait InvoicingStore:
    ConfigRepository
    + InvoiceRepository
    + SyncLogRepository
    + BulkJobRepository
    + OrderRepository
    + CompareRepository
{
    async fn health_check(&self) -> StoreResult<()>;
}
