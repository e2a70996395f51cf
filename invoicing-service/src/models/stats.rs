//! Aggregated views for the summary, stats and trends endpoints.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub total: i64,
    pub draft: i64,
    pub pending: i64,
    pub issued: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub issued_amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceStats {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub summary: InvoiceSummary,
    /// Issued over issued plus failed, in percent.
    pub success_rate: f64,
    pub pending_retries: i64,
    pub exhausted_retries: i64,
}

impl InvoiceStats {
    pub fn success_rate(summary: &InvoiceSummary) -> f64 {
        let settled = summary.issued + summary.failed;
        if settled == 0 {
            return 0.0;
        }
        summary.issued as f64 * 100.0 / settled as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub day: NaiveDate,
    pub created: i64,
    pub issued: i64,
    pub failed: i64,
    pub issued_amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_ignores_open_invoices() {
        let summary = InvoiceSummary {
            issued: 3,
            failed: 1,
            pending: 10,
            ..Default::default()
        };
        assert_eq!(InvoiceStats::success_rate(&summary), 75.0);
        assert_eq!(InvoiceStats::success_rate(&InvoiceSummary::default()), 0.0);
    }
}
