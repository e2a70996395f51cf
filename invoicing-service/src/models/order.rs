//! Order read model. Orders are owned by the orders module; the invoicing
//! core only reads them and writes back the issued invoice reference.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Partial,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paid" => PaymentStatus::Paid,
            "partial" => PaymentStatus::Partial,
            _ => PaymentStatus::Unpaid,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderCustomer {
    pub customer_id: Option<String>,
    pub customer_type: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub dni: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Option<Uuid>,
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
pub struct Order {
    pub order_id: Uuid,
    pub business_id: Uuid,
    pub integration_id: Uuid,
    pub order_number: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub payment_method_id: Option<i64>,
    pub order_type: Option<String>,
    pub status: String,
    pub customer: OrderCustomer,
    pub shipping_region: Option<String>,
    pub invoiceable: bool,
    pub items: Vec<OrderItem>,
    pub created_utc: DateTime<Utc>,
    pub invoice_number: Option<String>,
    pub invoice_url: Option<String>,
}

impl Order {
    /// Number of distinct order lines; used by the item-count filters.
    pub fn line_count(&self) -> usize {
        self.items.len()
    }
}
