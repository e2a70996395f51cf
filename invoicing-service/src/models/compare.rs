//! Reconciliation between system invoices and provider-held documents.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::invoice::{Invoice, InvoiceItem};

/// Longest window a single compare may cover.
pub const MAX_COMPARE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStatus {
    Pending,
    Completed,
}

impl CompareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareStatus::Pending => "pending",
            CompareStatus::Completed => "completed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => CompareStatus::Completed,
            _ => CompareStatus::Pending,
        }
    }
}

/// A compare awaiting (or having received) its provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    pub correlation_id: Uuid,
    pub business_id: Uuid,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    pub status: CompareStatus,
    pub requested_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Matched,
    ProviderOnly,
    SystemOnly,
}

/// A document as reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderDocument {
    #[serde(alias = "documentNumber", alias = "number")]
    pub invoice_number: String,
    #[serde(default, alias = "totalAmount")]
    pub total: Option<Decimal>,
    #[serde(default, alias = "customerName")]
    pub customer_name: Option<String>,
    #[serde(default, alias = "customerIdentification", alias = "customer_nit")]
    pub customer_dni: Option<String>,
    #[serde(default, alias = "customerEmail")]
    pub customer_email: Option<String>,
    #[serde(default, alias = "documentDate")]
    pub issue_date: Option<String>,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

impl ProviderDocument {
    /// Documents carried in a response's `document_json.documents[]`.
    /// Entries that cannot be read are skipped.
    pub fn list_from(document_json: Option<&serde_json::Value>) -> Vec<ProviderDocument> {
        document_json
            .and_then(|doc| doc.get("documents"))
            .and_then(|docs| docs.as_array())
            .map(|docs| {
                docs.iter()
                    .filter_map(|doc| serde_json::from_value::<ProviderDocument>(doc.clone()).ok())
                    .filter(|doc| !doc.invoice_number.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareItem {
    pub invoice_number: String,
    pub classification: Classification,
    pub system_invoice_id: Option<Uuid>,
    pub system_total: Option<Decimal>,
    pub provider_total: Option<Decimal>,
    pub customer_name: Option<String>,
    pub customer_dni: Option<String>,
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_items: Vec<InvoiceItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSummary {
    pub matched: usize,
    pub system_only: usize,
    pub provider_only: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResult {
    pub correlation_id: Uuid,
    pub business_id: Uuid,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    pub summary: CompareSummary,
    pub items: Vec<CompareItem>,
}

/// A system invoice together with its lines.
pub type SystemInvoice = (Invoice, Vec<InvoiceItem>);

/// Classify invoice numbers from both sides. Items come back ordered by number.
pub fn classify(
    system: Vec<SystemInvoice>,
    provider: Vec<ProviderDocument>,
) -> (CompareSummary, Vec<CompareItem>) {
    let mut system_by_number: BTreeMap<String, SystemInvoice> = BTreeMap::new();
    for (invoice, items) in system {
        if let Some(number) = invoice.invoice_number.clone() {
            system_by_number.insert(number, (invoice, items));
        }
    }
    let mut provider_by_number: BTreeMap<String, ProviderDocument> = BTreeMap::new();
    for doc in provider {
        provider_by_number.insert(doc.invoice_number.clone(), doc);
    }

    let mut summary = CompareSummary::default();
    let mut items = Vec::with_capacity(system_by_number.len() + provider_by_number.len());

    for (number, (invoice, lines)) in system_by_number {
        match provider_by_number.remove(&number) {
            Some(doc) => {
                summary.matched += 1;
                items.push(CompareItem {
                    invoice_number: number,
                    classification: Classification::Matched,
                    system_invoice_id: Some(invoice.invoice_id),
                    system_total: Some(invoice.total_amount),
                    provider_total: doc.total,
                    customer_name: doc.customer_name,
                    customer_dni: doc.customer_dni,
                    customer_email: doc.customer_email,
                    system_items: lines,
                    provider_items: doc.items,
                });
            }
            None => {
                summary.system_only += 1;
                items.push(CompareItem {
                    invoice_number: number,
                    classification: Classification::SystemOnly,
                    system_invoice_id: Some(invoice.invoice_id),
                    system_total: Some(invoice.total_amount),
                    provider_total: None,
                    customer_name: Some(invoice.customer.name),
                    customer_dni: invoice.customer.dni,
                    customer_email: invoice.customer.email,
                    system_items: lines,
                    provider_items: Vec::new(),
                });
            }
        }
    }

    for (number, doc) in provider_by_number {
        summary.provider_only += 1;
        items.push(CompareItem {
            invoice_number: number,
            classification: Classification::ProviderOnly,
            system_invoice_id: None,
            system_total: None,
            provider_total: doc.total,
            customer_name: doc.customer_name,
            customer_dni: doc.customer_dni,
            customer_email: doc.customer_email,
            system_items: Vec::new(),
            provider_items: doc.items,
        });
    }

    items.sort_by(|a, b| a.invoice_number.cmp(&b.invoice_number));
    (summary, items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::invoice::{CustomerSnapshot, InvoiceStatus};
    use serde_json::json;

    fn issued(number: &str, total: i64) -> SystemInvoice {
        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            invoicing_integration_id: Uuid::new_v4(),
            provider: "softpymes".into(),
            subtotal: Decimal::new(total, 0),
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            total_amount: Decimal::new(total, 0),
            currency: "COP".into(),
            customer: CustomerSnapshot {
                name: "Ana".into(),
                ..Default::default()
            },
            status: InvoiceStatus::Issued,
            external_id: None,
            invoice_number: Some(number.into()),
            invoice_url: None,
            pdf_url: None,
            xml_url: None,
            cufe: None,
            provider_response: None,
            metadata: json!({}),
            created_utc: now,
            updated_utc: now,
            issued_utc: Some(now),
            cancelled_utc: None,
            expires_utc: None,
        };
        (invoice, Vec::new())
    }

    #[test]
    fn classifies_each_number_once() {
        let provider = ProviderDocument::list_from(Some(&json!({
            "documents": [
                { "invoice_number": "FEV-2", "total": "2000" },
                { "documentNumber": "FEV-3", "customerName": "Luis" }
            ]
        })));

        let (summary, items) = classify(vec![issued("FEV-1", 1000), issued("FEV-2", 2000)], provider);

        assert_eq!(
            summary,
            CompareSummary {
                matched: 1,
                system_only: 1,
                provider_only: 1
            }
        );
        let classes: Vec<_> = items
            .iter()
            .map(|i| (i.invoice_number.as_str(), i.classification))
            .collect();
        assert_eq!(
            classes,
            vec![
                ("FEV-1", Classification::SystemOnly),
                ("FEV-2", Classification::Matched),
                ("FEV-3", Classification::ProviderOnly),
            ]
        );
        assert_eq!(items[1].provider_total, Some(Decimal::new(2000, 0)));
        assert_eq!(items[2].customer_name.as_deref(), Some("Luis"));
    }

    #[test]
    fn missing_documents_yield_empty_provider_side() {
        assert!(ProviderDocument::list_from(None).is_empty());
        assert!(ProviderDocument::list_from(Some(&json!({ "documents": "nope" }))).is_empty());
    }
}
