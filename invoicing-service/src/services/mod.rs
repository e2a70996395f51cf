//! Services module for invoicing-service.

pub mod bulk;
pub mod compare;
pub mod config_cache;
pub mod config_service;
pub mod database;
pub mod dispatcher;
pub mod events;
pub mod filters;
pub mod invoicing;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod reconciler;
pub mod repository;
pub mod retry;
pub mod softpymes;

pub use bulk::BulkService;
pub use compare::CompareService;
pub use config_cache::{ConfigCache, MemoryConfigCache, NoopConfigCache, RedisConfigCache};
pub use config_service::ConfigService;
pub use database::Database;
pub use dispatcher::Dispatcher;
pub use events::{DomainEventPublisher, EventPublisher, NoopEventPublisher, RedisEventPublisher};
pub use invoicing::{CancelOutcome, CreateInvoiceIntent, InvoicingService};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use reconciler::{Reconciled, ResponseReconciler};
pub use repository::InvoicingStore;
pub use retry::{RetryScheduler, SweepReport};
pub use softpymes::{ConnectionStatus, SoftpymesClient, SoftpymesCredentials};
