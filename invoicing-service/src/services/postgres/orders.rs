//! Order read model access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{Order, OrderCustomer, OrderItem, PaymentStatus};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{OrderRepository, StoreResult};

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: Uuid,
    business_id: Uuid,
    integration_id: Uuid,
    order_number: String,
    subtotal: Decimal,
    tax: Decimal,
    discount: Decimal,
    shipping_cost: Decimal,
    total_amount: Decimal,
    currency: String,
    payment_status: String,
    payment_method_id: Option<i64>,
    order_type: Option<String>,
    status: String,
    customer_id: Option<String>,
    customer_type: Option<String>,
    customer_name: String,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    customer_dni: Option<String>,
    shipping_region: Option<String>,
    invoiceable: bool,
    invoice_number: Option<String>,
    invoice_url: Option<String>,
    created_utc: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    product_id: Option<Uuid>,
    sku: String,
    name: String,
    description: Option<String>,
    quantity: i32,
    unit_price: Decimal,
    total_price: Decimal,
    tax: Decimal,
    tax_rate: Option<Decimal>,
    discount: Decimal,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItemRow>) -> Order {
        Order {
            order_id: self.order_id,
            business_id: self.business_id,
            integration_id: self.integration_id,
            order_number: self.order_number,
            subtotal: self.subtotal,
            tax: self.tax,
            discount: self.discount,
            shipping_cost: self.shipping_cost,
            total_amount: self.total_amount,
            currency: self.currency,
            payment_status: PaymentStatus::from_string(&self.payment_status),
            payment_method_id: self.payment_method_id,
            order_type: self.order_type,
            status: self.status,
            customer: OrderCustomer {
                customer_id: self.customer_id,
                customer_type: self.customer_type,
                name: self.customer_name,
                email: self.customer_email,
                phone: self.customer_phone,
                dni: self.customer_dni,
            },
            shipping_region: self.shipping_region,
            invoiceable: self.invoiceable,
            items: items
                .into_iter()
                .map(|i| OrderItem {
                    product_id: i.product_id,
                    sku: i.sku,
                    name: i.name,
                    description: i.description,
                    quantity: i.quantity,
                    unit_price: i.unit_price,
                    total_price: i.total_price,
                    tax: i.tax,
                    tax_rate: i.tax_rate,
                    discount: i.discount,
                })
                .collect(),
            created_utc: self.created_utc,
            invoice_number: self.invoice_number,
            invoice_url: self.invoice_url,
        }
    }
}

#[async_trait]
impl OrderRepository for Database {
    #[instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_id, business_id, integration_id, order_number, subtotal, tax, discount,
                   shipping_cost, total_amount, currency, payment_status, payment_method_id,
                   order_type, status, customer_id, customer_type, customer_name, customer_email,
                   customer_phone, customer_dni, shipping_region, invoiceable, invoice_number,
                   invoice_url, created_utc
            FROM orders
            WHERE order_id = $1 AND deleted_utc IS NULL
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get order", e))?;

        let Some(row) = row else {
            timer.observe_duration();
            return Ok(None);
        };

        let items = sqlx::query_as::<_, OrderItemRow>(
            r#"
            SELECT product_id, sku, name, description, quantity, unit_price, total_price,
                   tax, tax_rate, discount
            FROM order_items
            WHERE order_id = $1
            ORDER BY line_number
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get order items", e))?;

        timer.observe_duration();

        Ok(Some(row.into_order(items)))
    }

    #[instrument(skip(self))]
    async fn record_order_invoice(
        &self,
        order_id: Uuid,
        invoice_number: Option<&str>,
        invoice_url: Option<&str>,
    ) -> StoreResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_order_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE orders
            SET invoice_number = $2, invoice_url = $3, updated_utc = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(invoice_number)
        .bind(invoice_url)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record order invoice", e))?;

        timer.observe_duration();

        Ok(())
    }
}
