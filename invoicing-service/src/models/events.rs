//! Realtime event envelope fanned out on the pub/sub channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RealtimeEventType {
    #[serde(rename = "invoice.created")]
    InvoiceCreated,
    #[serde(rename = "invoice.failed")]
    InvoiceFailed,
    #[serde(rename = "invoice.cancelled")]
    InvoiceCancelled,
    #[serde(rename = "credit_note.created")]
    CreditNoteCreated,
    #[serde(rename = "bulk_job.progress")]
    BulkJobProgress,
    #[serde(rename = "bulk_job.completed")]
    BulkJobCompleted,
    #[serde(rename = "invoice.compare_ready")]
    CompareReady,
}

impl RealtimeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeEventType::InvoiceCreated => "invoice.created",
            RealtimeEventType::InvoiceFailed => "invoice.failed",
            RealtimeEventType::InvoiceCancelled => "invoice.cancelled",
            RealtimeEventType::CreditNoteCreated => "credit_note.created",
            RealtimeEventType::BulkJobProgress => "bulk_job.progress",
            RealtimeEventType::BulkJobCompleted => "bulk_job.completed",
            RealtimeEventType::CompareReady => "invoice.compare_ready",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub id: Uuid,
    pub event_type: RealtimeEventType,
    pub business_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(event_type: RealtimeEventType, business_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            business_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_dotted_event_names() {
        let event = RealtimeEvent::new(
            RealtimeEventType::BulkJobProgress,
            Uuid::new_v4(),
            serde_json::json!({ "processed": 1 }),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "bulk_job.progress");
        assert_eq!(value["data"]["processed"], 1);
    }
}
