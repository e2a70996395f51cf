//! Request and response bodies of the HTTP adapter.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::error::InvoicingError;
use crate::models::{
    BulkJob, BulkJobItem, FilterSet, Invoice, InvoiceItem, InvoiceStatus, ListInvoicesFilter,
    NewInvoicingConfig, ProviderConfig, SyncLog, UpdateInvoicingConfig, DEFAULT_PROVIDER,
};

/// Run `validator` rules and fold failures into a 400.
pub fn validated<T: Validate>(body: T) -> Result<T, InvoicingError> {
    body.validate()
        .map_err(|e| InvoicingError::InvalidInput(e.to_string()))?;
    Ok(body)
}

#[derive(Debug, Serialize)]
pub struct PageResponse<T: Serialize> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

// Invoices

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub order_id: Uuid,
    pub invoicing_integration_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    pub order_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[validate(range(min = 1))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub page_size: Option<i64>,
}

impl ListInvoicesQuery {
    pub fn into_filter(self, business_id: Option<Uuid>) -> ListInvoicesFilter {
        ListInvoicesFilter {
            business_id,
            status: self.status.as_deref().map(InvoiceStatus::from_string),
            order_id: self.order_id,
            start_date: self.start_date,
            end_date: self.end_date,
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(20),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvoiceDetailResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

#[derive(Debug, Serialize)]
pub struct SyncLogsResponse {
    pub invoice_id: Uuid,
    pub sync_logs: Vec<SyncLog>,
}

#[derive(Debug, Serialize)]
pub struct RetryAcceptedResponse {
    pub invoice_id: Uuid,
    pub sync_log_id: Uuid,
    pub correlation_id: Uuid,
    pub retry_count: i32,
}

impl From<SyncLog> for RetryAcceptedResponse {
    fn from(attempt: SyncLog) -> Self {
        Self {
            invoice_id: attempt.invoice_id,
            sync_log_id: attempt.sync_log_id,
            correlation_id: attempt.correlation_id,
            retry_count: attempt.retry_count,
        }
    }
}

// Bulk jobs

#[derive(Debug, Deserialize)]
pub struct BulkCreateRequest {
    pub order_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkCreateResponse {
    pub job_id: Uuid,
    pub status: String,
    pub total_orders: i32,
    pub status_url: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct PageQuery {
    #[validate(range(min = 1))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkJobResponse {
    #[serde(flatten)]
    pub job: BulkJob,
    pub progress_percent: f64,
    pub items: Vec<BulkJobItem>,
}

// Configs

#[derive(Debug, Deserialize, Validate)]
pub struct CreateConfigRequest {
    #[serde(alias = "integration_id")]
    pub source_integration_id: Uuid,
    pub invoicing_integration_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub provider: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_invoice: bool,
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default)]
    pub invoice_config: Map<String, Value>,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: Option<i32>,
}

fn default_true() -> bool {
    true
}

impl CreateConfigRequest {
    /// `default_max_retries` applies when the request names no budget.
    pub fn into_new(
        self,
        business_id: Uuid,
        created_by: Option<Uuid>,
        default_max_retries: i32,
    ) -> NewInvoicingConfig {
        NewInvoicingConfig {
            business_id,
            source_integration_id: self.source_integration_id,
            invoicing_integration_id: self.invoicing_integration_id,
            provider: self
                .provider
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            enabled: self.enabled,
            auto_invoice: self.auto_invoice,
            filters: self.filters,
            invoice_config: ProviderConfig::from_value(Value::Object(self.invoice_config)),
            description: self.description,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            created_by,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateConfigRequest {
    pub invoicing_integration_id: Option<Uuid>,
    #[validate(length(min = 1, max = 50))]
    pub provider: Option<String>,
    pub enabled: Option<bool>,
    pub auto_invoice: Option<bool>,
    pub filters: Option<FilterSet>,
    pub invoice_config: Option<Map<String, Value>>,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: Option<i32>,
}

impl From<UpdateConfigRequest> for UpdateInvoicingConfig {
    fn from(req: UpdateConfigRequest) -> Self {
        Self {
            invoicing_integration_id: req.invoicing_integration_id,
            provider: req.provider,
            enabled: req.enabled,
            auto_invoice: req.auto_invoice,
            filters: req.filters,
            invoice_config: req
                .invoice_config
                .map(|m| ProviderConfig::from_value(Value::Object(m))),
            description: req.description,
            max_retries: req.max_retries,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AutoInvoiceRequest {
    pub auto_invoice: bool,
}

// Compare

#[derive(Debug, Deserialize, Validate)]
pub struct CompareRequestBody {
    #[validate(length(min = 1))]
    pub date_from: String,
    #[validate(length(min = 1))]
    pub date_to: String,
    /// Extra keys are forwarded to the provider as hints.
    #[serde(flatten)]
    pub hints: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CompareAcceptedResponse {
    pub correlation_id: Uuid,
    pub status: &'static str,
}

// Reporting

#[derive(Debug, Default, Deserialize)]
pub struct DateRangeQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

// Providers

#[derive(Debug, Default, Deserialize, Validate)]
pub struct TestConnectionRequest {
    #[validate(length(min = 1))]
    pub api_key: Option<String>,
    #[validate(length(min = 1))]
    pub api_secret: Option<String>,
    pub referer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compare_body_keeps_unknown_keys_as_hints() {
        let body: CompareRequestBody = serde_json::from_value(json!({
            "date_from": "2026-03-01",
            "date_to": "2026-03-05",
            "branch": "north"
        }))
        .unwrap();
        assert_eq!(body.hints.get("branch"), Some(&json!("north")));
        assert!(!body.hints.contains_key("date_from"));
    }

    #[test]
    fn config_request_defaults() {
        let req: CreateConfigRequest = serde_json::from_value(json!({
            "integration_id": Uuid::new_v4(),
            "invoicing_integration_id": Uuid::new_v4()
        }))
        .unwrap();
        let new = req.into_new(Uuid::new_v4(), None, 5);
        assert!(new.enabled);
        assert!(!new.auto_invoice);
        assert_eq!(new.provider, DEFAULT_PROVIDER);
        assert_eq!(new.max_retries, 5);
    }

    #[test]
    fn explicit_retry_budget_beats_default() {
        let req: CreateConfigRequest = serde_json::from_value(json!({
            "integration_id": Uuid::new_v4(),
            "invoicing_integration_id": Uuid::new_v4(),
            "max_retries": 1
        }))
        .unwrap();
        assert_eq!(req.into_new(Uuid::new_v4(), None, 5).max_retries, 1);
    }

    #[test]
    fn page_size_above_limit_is_invalid() {
        let query = ListInvoicesQuery {
            page_size: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            validated(query),
            Err(InvoicingError::InvalidInput(_))
        ));
    }
}
