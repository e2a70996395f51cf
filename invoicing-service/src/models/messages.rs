//! Broker message payloads.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::invoice::CustomerSnapshot;
use crate::models::sync_log::{ProviderAudit, SyncOperation};

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_PAID: &str = "order.paid";

/// Order lifecycle event from the orders module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_type: String,
    pub order_id: Uuid,
    pub business_id: Uuid,
    #[serde(default)]
    pub integration_id: Option<Uuid>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub is_paid: bool,
    #[serde(default)]
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    pub fn triggers_invoicing(&self) -> bool {
        matches!(self.event_type.as_str(), ORDER_CREATED | ORDER_PAID)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItem {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub tax: Decimal,
    pub tax_rate: Option<Decimal>,
    pub discount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceData {
    pub integration_id: Uuid,
    #[serde(default)]
    pub items: Vec<RequestItem>,
    /// Provider configuration, passed through untouched.
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<RequestTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

/// Request published to `invoicing.requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequestMessage {
    pub invoice_id: Option<Uuid>,
    pub provider: String,
    pub operation: SyncOperation,
    pub invoice_data: InvoiceData,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response consumed from `invoicing.responses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceResponseMessage {
    #[serde(default)]
    pub invoice_id: Option<Uuid>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub operation: Option<SyncOperation>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub xml_url: Option<String>,
    #[serde(default)]
    pub cufe: Option<String>,
    #[serde(default)]
    pub issued_at: Option<String>,
    #[serde(default)]
    pub document_json: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_details: Option<serde_json::Value>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_time_ms: Option<i64>,
    #[serde(default)]
    pub audit_request_url: Option<String>,
    #[serde(default)]
    pub audit_request_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub audit_response_status: Option<i32>,
    #[serde(default)]
    pub audit_response_body: Option<serde_json::Value>,
}

impl InvoiceResponseMessage {
    pub fn is_compare(&self) -> bool {
        self.operation == Some(SyncOperation::Compare)
    }

    /// `issued_at` as RFC 3339, or as a zone-less ISO-8601 timestamp read as UTC.
    pub fn issued_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.issued_at.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn audit(&self) -> ProviderAudit {
        ProviderAudit {
            request_url: self.audit_request_url.clone(),
            request_payload: self.audit_request_payload.clone(),
            response_status: self.audit_response_status,
            response_body: self.audit_response_body.clone(),
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "provider reported an error".to_string())
    }
}

/// Internal work item published to `invoicing.bulk_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCreateMessage {
    pub job_id: Uuid,
    pub order_id: Uuid,
    pub business_id: Uuid,
    pub is_manual: bool,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    pub attempt_number: u32,
}

/// Domain event published to `invoicing.events` for other services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub business_id: Uuid,
    pub invoice_id: Uuid,
    pub order_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_tolerates_sparse_payloads() {
        let msg: InvoiceResponseMessage = serde_json::from_value(json!({
            "invoice_id": Uuid::new_v4(),
            "status": "error",
            "error_code": "TIMEOUT"
        }))
        .unwrap();

        assert_eq!(msg.status, ResponseStatus::Error);
        assert!(!msg.is_compare());
        assert_eq!(msg.error_message(), "provider reported an error");
    }

    #[test]
    fn issued_at_only_parses_iso_timestamps() {
        let mut msg: InvoiceResponseMessage = serde_json::from_value(json!({
            "status": "success",
            "issued_at": "2026-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(msg.issued_at_utc().is_some());

        msg.issued_at = Some("01/03/2026".into());
        assert!(msg.issued_at_utc().is_none());
    }

    #[test]
    fn zoneless_issued_at_is_read_as_utc() {
        let mut msg: InvoiceResponseMessage = serde_json::from_value(json!({
            "status": "success",
            "issued_at": "2026-03-01T10:00:00"
        }))
        .unwrap();
        let expected = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(msg.issued_at_utc(), Some(expected));

        msg.issued_at = Some("2026-03-01 10:00:00.000".into());
        assert_eq!(msg.issued_at_utc(), Some(expected));
    }

    #[test]
    fn order_event_filter() {
        let event: OrderEvent = serde_json::from_value(json!({
            "event_type": "order.cancelled",
            "order_id": Uuid::new_v4(),
            "business_id": Uuid::new_v4(),
            "timestamp": "2026-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(!event.triggers_invoicing());
    }
}
