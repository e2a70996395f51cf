//! Invoice aggregate for invoicing-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sync_log::SyncLog;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Issued,
    Cancelled,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => InvoiceStatus::Pending,
            "issued" => InvoiceStatus::Issued,
            "cancelled" => InvoiceStatus::Cancelled,
            "failed" => InvoiceStatus::Failed,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Customer fields copied from the order when the invoice is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub dni: Option<String>,
}

/// Invoice document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub business_id: Uuid,
    pub order_id: Uuid,
    pub invoicing_integration_id: Uuid,
    pub provider: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub customer: CustomerSnapshot,
    pub status: InvoiceStatus,
    pub external_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_url: Option<String>,
    pub pdf_url: Option<String>,
    pub xml_url: Option<String>,
    pub cufe: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub issued_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub expires_utc: Option<DateTime<Utc>>,
}

/// Line on an invoice. Written once, together with its invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub product_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub currency: String,
    pub tax: Decimal,
    pub tax_rate: Option<Decimal>,
    pub discount: Decimal,
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_id: Uuid,
    pub business_id: Uuid,
    pub order_id: Uuid,
    pub invoicing_integration_id: Uuid,
    pub provider: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub customer: CustomerSnapshot,
    pub metadata: serde_json::Value,
}

/// Input for an invoice line.
#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub product_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub currency: String,
    pub tax: Decimal,
    pub tax_rate: Option<Decimal>,
    pub discount: Decimal,
}

/// Rows written by one invoice-creation transaction.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
    /// The processing attempt whose request is published next.
    pub attempt: SyncLog,
}

/// Provider-assigned fields written when an invoice is issued.
#[derive(Debug, Clone, Default)]
pub struct IssuedInvoice {
    pub external_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_url: Option<String>,
    pub pdf_url: Option<String>,
    pub xml_url: Option<String>,
    pub cufe: Option<String>,
    pub issued_utc: DateTime<Utc>,
    pub provider_response: Option<serde_json::Value>,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub business_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
    pub order_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page: i64,
    pub page_size: i64,
}

impl ListInvoicesFilter {
    /// Page size clamped to 1..=100.
    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, 100)
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }
}

/// Prefer the current integration column, fall back to the legacy provider column.
pub fn resolve_integration_id(integration_id: Option<Uuid>, legacy_provider_id: Option<Uuid>) -> Option<Uuid> {
    integration_id.or(legacy_provider_id)
}
