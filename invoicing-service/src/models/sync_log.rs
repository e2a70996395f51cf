//! Sync-log attempts: one row per provider call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Retry,
    Cancel,
    Compare,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Retry => "retry",
            SyncOperation::Cancel => "cancel",
            SyncOperation::Compare => "compare",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "retry" => SyncOperation::Retry,
            "cancel" => SyncOperation::Cancel,
            "compare" => SyncOperation::Compare,
            _ => SyncOperation::Create,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => SyncStatus::Processing,
            "success" => SyncStatus::Success,
            "failed" => SyncStatus::Failed,
            "cancelled" => SyncStatus::Cancelled,
            _ => SyncStatus::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Processing)
    }
}

/// What started a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Auto,
    Manual,
    RetrySweep,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Auto => "auto",
            TriggerSource::Manual => "manual",
            TriggerSource::RetrySweep => "retry_sweep",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => TriggerSource::Manual,
            "retry_sweep" => TriggerSource::RetrySweep,
            _ => TriggerSource::Auto,
        }
    }
}

/// Delay before the next attempt, indexed by the failed attempt's retry count.
///
/// 5, 15 and 30 minutes; later attempts stay on the 30 minute tier.
pub fn backoff_delay(retry_count: i32) -> Duration {
    match retry_count {
        i32::MIN..=0 => Duration::minutes(5),
        1 => Duration::minutes(15),
        _ => Duration::minutes(30),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub sync_log_id: Uuid,
    pub invoice_id: Uuid,
    pub operation: SyncOperation,
    pub status: SyncStatus,
    pub correlation_id: Uuid,
    pub request_url: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub response_status: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_utc: Option<DateTime<Utc>>,
    /// Set once a retry sweep has picked this attempt up.
    pub retried_utc: Option<DateTime<Utc>>,
    pub trigger: TriggerSource,
    pub user_id: Option<Uuid>,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_utc: DateTime<Utc>,
}

impl SyncLog {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub invoice_id: Uuid,
    pub operation: SyncOperation,
    pub status: SyncStatus,
    pub correlation_id: Uuid,
    pub request_url: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub trigger: TriggerSource,
    pub user_id: Option<Uuid>,
}

/// Audit of the provider HTTP exchange, reported back by the provider router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderAudit {
    pub request_url: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub response_status: Option<i32>,
    pub response_body: Option<serde_json::Value>,
}

/// Terminal outcome written onto an attempt.
#[derive(Debug, Clone)]
pub struct SyncLogCompletion {
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub next_retry_utc: Option<DateTime<Utc>>,
    pub audit: ProviderAudit,
    pub completed_utc: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SyncLogCompletion {
    pub fn success(started_utc: DateTime<Utc>, audit: ProviderAudit) -> Self {
        let completed_utc = Utc::now();
        Self {
            status: SyncStatus::Success,
            error_message: None,
            error_code: None,
            error_details: None,
            next_retry_utc: None,
            audit,
            completed_utc,
            duration_ms: (completed_utc - started_utc).num_milliseconds().max(0),
        }
    }

    /// Failure outcome; schedules the next attempt when the budget allows it.
    pub fn failure(
        attempt: &SyncLog,
        message: impl Into<String>,
        code: Option<String>,
        details: Option<serde_json::Value>,
        audit: ProviderAudit,
    ) -> Self {
        let completed_utc = Utc::now();
        let next_retry_utc = attempt
            .can_retry()
            .then(|| completed_utc + backoff_delay(attempt.retry_count));
        Self {
            status: SyncStatus::Failed,
            error_message: Some(message.into()),
            error_code: code,
            error_details: details,
            next_retry_utc,
            audit,
            completed_utc,
            duration_ms: (completed_utc - attempt.started_utc).num_milliseconds().max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(retry_count: i32, max_retries: i32) -> SyncLog {
        let now = Utc::now();
        SyncLog {
            sync_log_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            operation: SyncOperation::Create,
            status: SyncStatus::Processing,
            correlation_id: Uuid::new_v4(),
            request_url: None,
            request_payload: None,
            response_status: None,
            response_body: None,
            error_message: None,
            error_code: None,
            error_details: None,
            retry_count,
            max_retries,
            next_retry_utc: None,
            retried_utc: None,
            trigger: TriggerSource::Auto,
            user_id: None,
            started_utc: now,
            completed_utc: None,
            duration_ms: None,
            created_utc: now,
        }
    }

    #[test]
    fn backoff_follows_schedule_and_caps_at_thirty_minutes() {
        assert_eq!(backoff_delay(0), Duration::minutes(5));
        assert_eq!(backoff_delay(1), Duration::minutes(15));
        assert_eq!(backoff_delay(2), Duration::minutes(30));
        assert_eq!(backoff_delay(7), Duration::minutes(30));
    }

    #[test]
    fn failure_schedules_retry_while_budget_remains() {
        let completion = SyncLogCompletion::failure(
            &attempt(0, 3),
            "timeout",
            Some("TIMEOUT".into()),
            None,
            ProviderAudit::default(),
        );
        let next = completion.next_retry_utc.unwrap();
        let delay = next - completion.completed_utc;
        assert_eq!(delay, Duration::minutes(5));
    }

    #[test]
    fn failure_at_budget_leaves_no_retry() {
        let completion = SyncLogCompletion::failure(
            &attempt(3, 3),
            "timeout",
            None,
            None,
            ProviderAudit::default(),
        );
        assert!(completion.next_retry_utc.is_none());
    }

    #[test]
    fn trigger_round_trips() {
        for trigger in [TriggerSource::Auto, TriggerSource::Manual, TriggerSource::RetrySweep] {
            assert_eq!(TriggerSource::from_string(trigger.as_str()), trigger);
        }
    }
}
