//! Shared harness: the invoicing core wired over in-memory adapters.

#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::messaging::MemoryBroker;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use invoicing_service::config::{QueueConfig, RetryConfig, SoftpymesConfig};
use invoicing_service::models::{
    AmountFilter, FilterSet, InvoiceRequestMessage, InvoiceResponseMessage, InvoicingConfig,
    NewInvoicingConfig, Order, OrderCustomer, OrderItem, PaymentFilter, PaymentStatus,
    ProviderConfig, RealtimeEvent, RealtimeEventType,
};
use invoicing_service::services::{EventPublisher, MemoryConfigCache, MemoryStore, RetryScheduler};
use invoicing_service::{router, AppState, Components};

pub const NOWHERE: &str = "http://127.0.0.1:9";

/// Keeps every realtime event in memory.
#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RealtimeEvent>>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: RealtimeEventType) -> Vec<RealtimeEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn count(&self, event_type: RealtimeEventType) -> usize {
        self.of_type(event_type).len()
    }
}

impl EventPublisher for RecordingEventPublisher {
    fn publish(&self, event: RealtimeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct TestApp {
    pub store: MemoryStore,
    pub broker: MemoryBroker,
    pub cache: MemoryConfigCache,
    pub events: RecordingEventPublisher,
    pub components: Components,
    pub queues: QueueConfig,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_softpymes(SoftpymesConfig {
            base_url: NOWHERE.to_string(),
            timeout: Duration::from_secs(5),
            referer: None,
            api_key: None,
            api_secret: None,
        })
    }

    pub fn with_softpymes(softpymes: SoftpymesConfig) -> Self {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let cache = MemoryConfigCache::new();
        let events = RecordingEventPublisher::new();
        let queues = QueueConfig::default();

        let components = Components::assemble(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            Arc::new(cache.clone()),
            Arc::new(events.clone()),
            queues.clone(),
            softpymes,
        )
        .expect("Failed to assemble components");

        Self {
            store,
            broker,
            cache,
            events,
            components,
            queues,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.components = self.components.with_default_max_retries(max_retries);
        self
    }

    pub fn state(&self) -> AppState {
        self.components.state.clone()
    }

    pub fn router(&self) -> axum::Router {
        router(self.state(), Duration::from_secs(5))
    }

    pub fn retry_scheduler(&self) -> RetryScheduler {
        self.components.retry_scheduler(RetryConfig::default())
    }

    /// Enabled, auto-invoicing config requiring a paid order and, when given,
    /// a minimum total.
    pub async fn config(&self, business_id: Uuid, min_amount: Option<Decimal>) -> InvoicingConfig {
        let filters = FilterSet {
            amount: min_amount.map(|min| AmountFilter {
                min: Some(min),
                max: None,
            }),
            payment: Some(PaymentFilter {
                status: Some(PaymentStatus::Paid),
                allowed_method_ids: vec![],
            }),
            ..Default::default()
        };
        self.state()
            .configs
            .create(NewInvoicingConfig {
                business_id,
                source_integration_id: Uuid::new_v4(),
                invoicing_integration_id: Uuid::new_v4(),
                provider: "softpymes".to_string(),
                enabled: true,
                auto_invoice: true,
                filters,
                invoice_config: ProviderConfig::from_value(json!({ "resolution": "18760000001" })),
                description: None,
                max_retries: 3,
                created_by: None,
            })
            .await
            .expect("Failed to create config")
    }

    /// Seed a paid, invoiceable order with one line.
    pub fn order(&self, config: &InvoicingConfig, total: Decimal) -> Order {
        let order = Order {
            order_id: Uuid::new_v4(),
            business_id: config.business_id,
            integration_id: config.source_integration_id,
            order_number: format!("ORD-{}", &Uuid::new_v4().simple().to_string()[..8]),
            subtotal: total,
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            total_amount: total,
            currency: "COP".to_string(),
            payment_status: PaymentStatus::Paid,
            payment_method_id: Some(1),
            order_type: None,
            status: "completed".to_string(),
            customer: OrderCustomer {
                customer_id: Some("C-1".to_string()),
                customer_type: Some("person".to_string()),
                name: "Ana Gomez".to_string(),
                email: Some("ana@example.com".to_string()),
                phone: None,
                dni: Some("1020304050".to_string()),
            },
            shipping_region: Some("Antioquia".to_string()),
            invoiceable: true,
            items: vec![OrderItem {
                product_id: None,
                sku: "SKU-1".to_string(),
                name: "Coffee".to_string(),
                description: None,
                quantity: 1,
                unit_price: total,
                total_price: total,
                tax: Decimal::ZERO,
                tax_rate: None,
                discount: Decimal::ZERO,
            }],
            created_utc: Utc::now(),
            invoice_number: None,
            invoice_url: None,
        };
        self.store.put_order(order.clone());
        order
    }

    /// Drain every request waiting on `invoicing.requests`.
    pub fn take_requests(&self) -> Vec<InvoiceRequestMessage> {
        self.broker.drain_json(&self.queues.requests)
    }

    pub fn take_request(&self) -> InvoiceRequestMessage {
        let mut requests = self.take_requests();
        assert_eq!(requests.len(), 1, "expected exactly one provider request");
        requests.remove(0)
    }

    pub async fn respond_success(&self, request: &InvoiceRequestMessage, number: &str, cufe: &str) {
        self.components
            .reconciler
            .reconcile(&success_response(request, number, cufe))
            .await
            .expect("Failed to reconcile success");
    }

    pub async fn respond_error(&self, request: &InvoiceRequestMessage, code: &str) {
        self.components
            .reconciler
            .reconcile(&error_response(request, code))
            .await
            .expect("Failed to reconcile error");
    }

    pub fn count(&self, event_type: RealtimeEventType) -> usize {
        self.events.count(event_type)
    }
}

/// Whole currency units as a two-decimal amount.
pub fn money(units: i64) -> Decimal {
    Decimal::new(units * 100, 2)
}

pub fn success_response(
    request: &InvoiceRequestMessage,
    number: &str,
    cufe: &str,
) -> InvoiceResponseMessage {
    serde_json::from_value(json!({
        "invoice_id": request.invoice_id,
        "provider": request.provider,
        "operation": request.operation,
        "status": "success",
        "invoice_number": number,
        "external_id": format!("ext-{}", number),
        "cufe": cufe,
        "issued_at": "2026-03-01T10:00:00Z",
        "correlation_id": request.correlation_id,
        "document_json": { "number": number }
    }))
    .expect("valid response")
}

pub fn error_response(request: &InvoiceRequestMessage, code: &str) -> InvoiceResponseMessage {
    serde_json::from_value(json!({
        "invoice_id": request.invoice_id,
        "provider": request.provider,
        "operation": request.operation,
        "status": "error",
        "error": format!("provider failed with {}", code),
        "error_code": code,
        "correlation_id": request.correlation_id
    }))
    .expect("valid response")
}
