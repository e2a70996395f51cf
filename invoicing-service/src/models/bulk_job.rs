//! Bulk invoice jobs and their per-order items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_BULK_ORDERS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BulkJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkJobStatus::Pending => "pending",
            BulkJobStatus::Processing => "processing",
            BulkJobStatus::Completed => "completed",
            BulkJobStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => BulkJobStatus::Processing,
            "completed" => BulkJobStatus::Completed,
            "failed" => BulkJobStatus::Failed,
            _ => BulkJobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl BulkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkItemStatus::Pending => "pending",
            BulkItemStatus::Processing => "processing",
            BulkItemStatus::Success => "success",
            BulkItemStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => BulkItemStatus::Processing,
            "success" => BulkItemStatus::Success,
            "failed" => BulkItemStatus::Failed,
            _ => BulkItemStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BulkItemStatus::Success | BulkItemStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub job_id: Uuid,
    pub business_id: Uuid,
    pub created_by: Option<Uuid>,
    pub total_orders: i32,
    pub processed: i32,
    pub successful: i32,
    pub failed: i32,
    pub status: BulkJobStatus,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl BulkJob {
    pub fn is_settled(&self) -> bool {
        self.successful + self.failed >= self.total_orders
    }

    /// Percentage of orders with a terminal outcome.
    pub fn progress_percent(&self) -> f64 {
        if self.total_orders == 0 {
            return 100.0;
        }
        f64::from(self.successful + self.failed) * 100.0 / f64::from(self.total_orders)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJobItem {
    pub item_id: Uuid,
    pub job_id: Uuid,
    pub order_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub status: BulkItemStatus,
    pub error_message: Option<String>,
    pub processed_utc: Option<DateTime<Utc>>,
}

/// Counter deltas applied atomically to a job row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCounterDelta {
    pub processed: i32,
    pub successful: i32,
    pub failed: i32,
}

impl BulkCounterDelta {
    pub fn dispatched() -> Self {
        Self {
            processed: 1,
            ..Default::default()
        }
    }

    pub fn failed_before_dispatch() -> Self {
        Self {
            processed: 1,
            failed: 1,
            ..Default::default()
        }
    }

    pub fn succeeded() -> Self {
        Self {
            successful: 1,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Default::default()
        }
    }
}
