//! Domain models for invoicing-service.

pub mod bulk_job;
pub mod compare;
pub mod config;
pub mod events;
pub mod invoice;
pub mod messages;
pub mod order;
pub mod stats;
pub mod sync_log;

pub use bulk_job::{
    BulkCounterDelta, BulkItemStatus, BulkJob, BulkJobItem, BulkJobStatus, MAX_BULK_ORDERS,
};
pub use compare::{
    classify, Classification, CompareItem, CompareRequest, CompareResult, CompareStatus,
    CompareSummary, ProviderDocument, MAX_COMPARE_WINDOW_DAYS,
};
pub use config::{
    AmountFilter, CatalogFilter, CustomerFilter, DateRangeFilter, FilterSet, GeographyFilter,
    InvoicingConfig, NewInvoicingConfig, OrderShapeFilter, PaymentFilter, ProviderConfig,
    UpdateInvoicingConfig, DEFAULT_MAX_RETRIES, DEFAULT_PROVIDER,
};
pub use events::{RealtimeEvent, RealtimeEventType};
pub use invoice::{
    resolve_integration_id, CreatedInvoice, CustomerSnapshot, Invoice, InvoiceItem,
    InvoiceStatus, IssuedInvoice, ListInvoicesFilter, NewInvoice, NewInvoiceItem,
};
pub use messages::{
    BulkCreateMessage, DomainEvent, InvoiceData, InvoiceRequestMessage, InvoiceResponseMessage,
    OrderEvent, RequestItem, RequestTotals, ResponseStatus,
};
pub use order::{Order, OrderCustomer, OrderItem, PaymentStatus};
pub use stats::{InvoiceStats, InvoiceSummary, TrendPoint};
pub use sync_log::{
    backoff_delay, NewSyncLog, ProviderAudit, SyncLog, SyncLogCompletion, SyncOperation,
    SyncStatus, TriggerSource,
};
