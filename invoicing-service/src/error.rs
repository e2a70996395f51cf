//! Error taxonomy for the invoicing core.
//!
//! Every fallible operation returns an [`InvoicingError`]; the HTTP adapter maps
//! each variant to a status code and a stable machine code, and the consumer
//! loops use [`InvoicingError::is_transient`] to decide between ack and requeue.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::services::metrics::ERRORS_TOTAL;

/// The first filter rule an order failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterRejection {
    #[error("order total {total} is below the minimum {min}")]
    BelowMinimum { total: Decimal, min: Decimal },

    #[error("order total {total} is above the maximum {max}")]
    AboveMaximum { total: Decimal, max: Decimal },

    #[error("order payment status is {actual}, {required} required")]
    NotPaid { required: String, actual: String },

    #[error("payment method {method:?} is not allowed")]
    PaymentMethodNotAllowed { method: Option<i64> },

    #[error("order type {order_type:?} is not allowed")]
    OrderTypeNotAllowed { order_type: Option<String> },

    #[error("order status {status} is excluded")]
    StatusExcluded { status: String },

    #[error("product {sku} is excluded")]
    ProductExcluded { sku: String },

    #[error("product {sku} is not in the allowed list")]
    ProductNotAllowed { sku: String },

    #[error("order has {count} items, minimum is {min}")]
    MinItems { count: usize, min: u32 },

    #[error("order has {count} items, maximum is {max}")]
    MaxItems { count: usize, max: u32 },

    #[error("customer type {customer_type:?} is not allowed")]
    CustomerTypeNotAllowed { customer_type: Option<String> },

    #[error("customer {customer_id} is excluded")]
    CustomerExcluded { customer_id: String },

    #[error("shipping region {region:?} is not allowed")]
    RegionNotAllowed { region: Option<String> },

    #[error("order date {date} is outside the configured range")]
    OutsideDateRange { date: chrono::NaiveDate },
}

impl FilterRejection {
    pub fn code(&self) -> &'static str {
        match self {
            FilterRejection::BelowMinimum { .. } => "amount_below_minimum",
            FilterRejection::AboveMaximum { .. } => "amount_above_maximum",
            FilterRejection::NotPaid { .. } => "order_not_paid",
            FilterRejection::PaymentMethodNotAllowed { .. } => "payment_method_not_allowed",
            FilterRejection::OrderTypeNotAllowed { .. } => "order_type_not_allowed",
            FilterRejection::StatusExcluded { .. } => "order_status_excluded",
            FilterRejection::ProductExcluded { .. } => "product_excluded",
            FilterRejection::ProductNotAllowed { .. } => "product_not_allowed",
            FilterRejection::MinItems { .. } => "min_items_not_met",
            FilterRejection::MaxItems { .. } => "max_items_exceeded",
            FilterRejection::CustomerTypeNotAllowed { .. } => "customer_type_not_allowed",
            FilterRejection::CustomerExcluded { .. } => "customer_excluded",
            FilterRejection::RegionNotAllowed { .. } => "region_not_allowed",
            FilterRejection::OutsideDateRange { .. } => "outside_date_range",
        }
    }
}

#[derive(Debug, Error)]
pub enum InvoicingError {
    // Not found
    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("invoicing config not found")]
    ConfigNotFound,

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("no invoicing provider configured for integration {0}")]
    ProviderNotConfigured(Uuid),

    #[error("no sync log found for invoice {0}")]
    SyncLogNotFound(Uuid),

    #[error("bulk job {0} not found")]
    BulkJobNotFound(Uuid),

    #[error("credit note not found")]
    CreditNoteNotFound,

    // Conflict
    #[error("business already has an active invoicing config")]
    ActiveInvoicingConfigExists,

    #[error("integration already has an invoicing config")]
    ConfigAlreadyExists,

    #[error("order {0} is already invoiced with this provider")]
    OrderAlreadyInvoiced(Uuid),

    #[error("invoice is already issued")]
    InvoiceAlreadyIssued,

    #[error("invoice is already cancelled")]
    InvoiceAlreadyCancelled,

    // Business rules
    #[error("order {0} is not invoiceable")]
    OrderNotInvoiceable(Uuid),

    #[error("invoicing config is disabled")]
    ConfigNotEnabled,

    #[error("auto invoicing is disabled")]
    AutoInvoiceDisabled,

    #[error("provider integration is inactive")]
    ProviderInactive,

    #[error("retry not allowed: {0}")]
    RetryNotAllowed(String),

    #[error("maximum retries exceeded")]
    MaxRetriesExceeded,

    #[error("order rejected by filters: {0}")]
    Filter(#[from] FilterRejection),

    #[error("compare window may not exceed {max_days} days")]
    CompareDateRangeTooLarge { max_days: i64 },

    #[error("credit notes are issued by the invoicing integration")]
    CreditNoteDelegated,

    // Input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid filter config: {0}")]
    InvalidFilterConfig(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    // Upstream auth
    #[error("provider rejected credentials")]
    ProviderUnauthorized,

    #[error("provider token expired")]
    TokenExpired,

    #[error("provider token refresh failed: {0}")]
    TokenRefreshFailed(String),

    // Upstream throttling
    #[error("provider rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("failed to publish provider request: {0}")]
    Publish(String),

    #[error(transparent)]
    Infrastructure(#[from] AppError),
}

impl InvoicingError {
    /// Stable machine-readable code for clients and logs.
    pub fn code(&self) -> &'static str {
        match self {
            InvoicingError::InvoiceNotFound(_) => "invoice_not_found",
            InvoicingError::ConfigNotFound => "config_not_found",
            InvoicingError::OrderNotFound(_) => "order_not_found",
            InvoicingError::ProviderNotConfigured(_) => "provider_not_configured",
            InvoicingError::SyncLogNotFound(_) => "sync_log_not_found",
            InvoicingError::BulkJobNotFound(_) => "bulk_job_not_found",
            InvoicingError::CreditNoteNotFound => "credit_note_not_found",
            InvoicingError::ActiveInvoicingConfigExists => "active_config_exists",
            InvoicingError::ConfigAlreadyExists => "config_already_exists",
            InvoicingError::OrderAlreadyInvoiced(_) => "order_already_invoiced",
            InvoicingError::InvoiceAlreadyIssued => "invoice_already_issued",
            InvoicingError::InvoiceAlreadyCancelled => "invoice_already_cancelled",
            InvoicingError::OrderNotInvoiceable(_) => "order_not_invoiceable",
            InvoicingError::ConfigNotEnabled => "config_not_enabled",
            InvoicingError::AutoInvoiceDisabled => "auto_invoice_disabled",
            InvoicingError::ProviderInactive => "provider_inactive",
            InvoicingError::RetryNotAllowed(_) => "retry_not_allowed",
            InvoicingError::MaxRetriesExceeded => "max_retries_exceeded",
            InvoicingError::Filter(rejection) => rejection.code(),
            InvoicingError::CompareDateRangeTooLarge { .. } => "compare_date_range_too_large",
            InvoicingError::CreditNoteDelegated => "credit_note_delegated",
            InvoicingError::InvalidInput(_) => "invalid_input",
            InvoicingError::MissingField(_) => "missing_required_field",
            InvoicingError::InvalidFilterConfig(_) => "invalid_filter_config",
            InvoicingError::InvalidDate(_) => "invalid_date",
            InvoicingError::ProviderUnauthorized => "provider_unauthorized",
            InvoicingError::TokenExpired => "provider_token_expired",
            InvoicingError::TokenRefreshFailed(_) => "provider_token_refresh_failed",
            InvoicingError::RateLimited { .. } => "provider_rate_limited",
            InvoicingError::Provider(_) => "provider_error",
            InvoicingError::Publish(_) => "publish_error",
            InvoicingError::Infrastructure(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            InvoicingError::InvoiceNotFound(_)
            | InvoicingError::ConfigNotFound
            | InvoicingError::OrderNotFound(_)
            | InvoicingError::ProviderNotConfigured(_)
            | InvoicingError::SyncLogNotFound(_)
            | InvoicingError::BulkJobNotFound(_)
            | InvoicingError::CreditNoteNotFound => StatusCode::NOT_FOUND,

            InvoicingError::ActiveInvoicingConfigExists
            | InvoicingError::ConfigAlreadyExists
            | InvoicingError::OrderAlreadyInvoiced(_)
            | InvoicingError::InvoiceAlreadyIssued
            | InvoicingError::InvoiceAlreadyCancelled => StatusCode::CONFLICT,

            InvoicingError::OrderNotInvoiceable(_)
            | InvoicingError::ConfigNotEnabled
            | InvoicingError::AutoInvoiceDisabled
            | InvoicingError::ProviderInactive
            | InvoicingError::RetryNotAllowed(_)
            | InvoicingError::MaxRetriesExceeded
            | InvoicingError::Filter(_)
            | InvoicingError::CompareDateRangeTooLarge { .. }
            | InvoicingError::CreditNoteDelegated => StatusCode::UNPROCESSABLE_ENTITY,

            InvoicingError::InvalidInput(_)
            | InvoicingError::MissingField(_)
            | InvoicingError::InvalidFilterConfig(_)
            | InvoicingError::InvalidDate(_) => StatusCode::BAD_REQUEST,

            InvoicingError::ProviderUnauthorized
            | InvoicingError::TokenExpired
            | InvoicingError::TokenRefreshFailed(_) => StatusCode::UNAUTHORIZED,

            InvoicingError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            InvoicingError::Provider(_) | InvoicingError::Publish(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            InvoicingError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Business-rule rejections that a consumer acknowledges and drops.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self.status_code(),
            StatusCode::NOT_FOUND
                | StatusCode::CONFLICT
                | StatusCode::UNPROCESSABLE_ENTITY
                | StatusCode::BAD_REQUEST
        )
    }

    /// Infrastructure failures worth redelivering.
    pub fn is_transient(&self) -> bool {
        match self {
            InvoicingError::Infrastructure(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for InvoicingError {
    fn from(err: sqlx::Error) -> Self {
        InvoicingError::Infrastructure(AppError::DatabaseError(anyhow::Error::new(err)))
    }
}

impl IntoResponse for InvoicingError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        ERRORS_TOTAL.with_label_values(&[self.code()]).inc();

        if let InvoicingError::Infrastructure(inner) = self {
            tracing::error!(error = %inner, "Infrastructure failure");
            return inner.into_response();
        }

        let status = self.status_code();
        let code = self.code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let (error, details) = match &self {
            InvoicingError::Filter(rejection) => {
                ("order rejected by filters".to_string(), Some(rejection.to_string()))
            }
            InvoicingError::Publish(reason) => {
                ("failed to dispatch invoice".to_string(), Some(reason.clone()))
            }
            _ => (self.to_string(), None),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error,
                code,
                details,
            }),
        )
            .into_response();

        if let InvoicingError::RateLimited {
            retry_after: Some(secs),
        } = self
        {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rejections_are_unprocessable() {
        let err = InvoicingError::from(FilterRejection::BelowMinimum {
            total: Decimal::new(9999, 2),
            min: Decimal::new(10000, 2),
        });
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code(), "amount_below_minimum");
        assert!(err.is_business_rule());
        assert!(!err.is_transient());
    }

    #[test]
    fn taxa_map_to_status_codes() {
        assert_eq!(
            InvoicingError::OrderAlreadyInvoiced(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            InvoicingError::InvoiceNotFound(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            InvoicingError::RateLimited { retry_after: None }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            InvoicingError::Publish("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            InvoicingError::InvalidFilterConfig("min > max".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn database_failures_are_transient() {
        let err = InvoicingError::Infrastructure(AppError::DatabaseError(anyhow::anyhow!("gone")));
        assert!(err.is_transient());
        assert!(!err.is_business_rule());
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let response = InvoicingError::RateLimited {
            retry_after: Some(30),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");
    }
}
