//! Per-integration invoicing configuration.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::order::PaymentStatus;

pub const DEFAULT_PROVIDER: &str = "softpymes";
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Provider settings passed through to the provider untouched.
///
/// The core never reads keys out of this blob; it can only merge extra
/// pass-through hints before a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig(Map<String, Value>);

impl ProviderConfig {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn with_hints<I>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in hints {
            self.0.insert(key, value);
        }
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmountFilter {
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub allowed_method_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderShapeFilter {
    #[serde(default)]
    pub allowed_order_types: Vec<String>,
    #[serde(default)]
    pub excluded_statuses: Vec<String>,
    pub min_items: Option<u32>,
    pub max_items: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFilter {
    #[serde(default)]
    pub excluded_skus: Vec<String>,
    #[serde(default)]
    pub allowed_skus: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerFilter {
    #[serde(default)]
    pub allowed_customer_types: Vec<String>,
    #[serde(default)]
    pub excluded_customer_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeographyFilter {
    #[serde(default)]
    pub allowed_regions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRangeFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Optional constraints an order must satisfy to be invoiced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<AmountFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_shape: Option<OrderShapeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geography: Option<GeographyFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRangeFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicingConfig {
    pub config_id: Uuid,
    pub business_id: Uuid,
    pub source_integration_id: Uuid,
    pub invoicing_integration_id: Uuid,
    pub provider: String,
    pub enabled: bool,
    pub auto_invoice: bool,
    pub filters: FilterSet,
    pub invoice_config: ProviderConfig,
    pub description: Option<String>,
    pub max_retries: i32,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating (or overwriting a disabled) config.
#[derive(Debug, Clone)]
pub struct NewInvoicingConfig {
    pub business_id: Uuid,
    pub source_integration_id: Uuid,
    pub invoicing_integration_id: Uuid,
    pub provider: String,
    pub enabled: bool,
    pub auto_invoice: bool,
    pub filters: FilterSet,
    pub invoice_config: ProviderConfig,
    pub description: Option<String>,
    pub max_retries: i32,
    pub created_by: Option<Uuid>,
}

/// Partial update; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoicingConfig {
    pub invoicing_integration_id: Option<Uuid>,
    pub provider: Option<String>,
    pub enabled: Option<bool>,
    pub auto_invoice: Option<bool>,
    pub filters: Option<FilterSet>,
    pub invoice_config: Option<ProviderConfig>,
    pub description: Option<String>,
    pub max_retries: Option<i32>,
}

impl UpdateInvoicingConfig {
    /// Apply the update onto a loaded config.
    pub fn apply(&self, config: &mut InvoicingConfig) {
        if let Some(id) = self.invoicing_integration_id {
            config.invoicing_integration_id = id;
        }
        if let Some(provider) = &self.provider {
            config.provider = provider.clone();
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(auto_invoice) = self.auto_invoice {
            config.auto_invoice = auto_invoice;
        }
        if let Some(filters) = &self.filters {
            config.filters = filters.clone();
        }
        if let Some(invoice_config) = &self.invoice_config {
            config.invoice_config = invoice_config.clone();
        }
        if let Some(description) = &self.description {
            config.description = Some(description.clone());
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        config.updated_utc = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_set_parses_partial_json() {
        let filters: FilterSet = serde_json::from_value(json!({
            "amount": { "min": "100000" },
            "payment": { "status": "paid" }
        }))
        .unwrap();

        assert_eq!(
            filters.amount.unwrap().min,
            Some(Decimal::new(100000, 0))
        );
        assert_eq!(filters.payment.unwrap().status, Some(PaymentStatus::Paid));
        assert!(filters.catalog.is_none());
    }

    #[test]
    fn provider_config_merges_hints_without_dropping_keys() {
        let config = ProviderConfig::from_value(json!({ "resolution": "FEV" }));
        let merged = config.with_hints([("date_from".to_string(), json!("2026-01-01"))]);

        assert_eq!(
            merged.into_value(),
            json!({ "resolution": "FEV", "date_from": "2026-01-01" })
        );
    }

    #[test]
    fn provider_config_ignores_non_object_values() {
        assert_eq!(ProviderConfig::from_value(json!([1, 2])), ProviderConfig::default());
    }
}
