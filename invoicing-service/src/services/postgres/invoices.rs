//! Invoice aggregate persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    resolve_integration_id, CreatedInvoice, CustomerSnapshot, Invoice, InvoiceItem,
    InvoiceStatus, InvoiceSummary, IssuedInvoice, ListInvoicesFilter, NewInvoice,
    NewInvoiceItem, NewSyncLog, TrendPoint,
};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{InvoiceRepository, StoreResult};

use super::sync_logs::insert_sync_log_row;

const INVOICE_COLUMNS: &str = r#"
    invoice_id, business_id, order_id, invoicing_integration_id, invoicing_provider_id,
    provider, subtotal, tax, discount, shipping_cost, total_amount, currency,
    customer_name, customer_email, customer_phone, customer_dni, status, external_id,
    invoice_number, invoice_url, pdf_url, xml_url, cufe, provider_response, metadata,
    created_utc, updated_utc, issued_utc, cancelled_utc, expires_utc
"#;

const ITEM_COLUMNS: &str = r#"
    item_id, invoice_id, product_id, sku, name, description, quantity, unit_price,
    total_price, currency, tax, tax_rate, discount
"#;

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    business_id: Uuid,
    order_id: Uuid,
    invoicing_integration_id: Option<Uuid>,
    invoicing_provider_id: Option<Uuid>,
    provider: String,
    subtotal: Decimal,
    tax: Decimal,
    discount: Decimal,
    shipping_cost: Decimal,
    total_amount: Decimal,
    currency: String,
    customer_name: String,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    customer_dni: Option<String>,
    status: String,
    external_id: Option<String>,
    invoice_number: Option<String>,
    invoice_url: Option<String>,
    pdf_url: Option<String>,
    xml_url: Option<String>,
    cufe: Option<String>,
    provider_response: Option<Json<serde_json::Value>>,
    metadata: Json<serde_json::Value>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    issued_utc: Option<DateTime<Utc>>,
    cancelled_utc: Option<DateTime<Utc>>,
    expires_utc: Option<DateTime<Utc>>,
}

impl InvoiceRow {
    fn into_invoice(self) -> Invoice {
        Invoice {
            invoice_id: self.invoice_id,
            business_id: self.business_id,
            order_id: self.order_id,
            // The table CHECK guarantees one of the two columns is set.
            invoicing_integration_id: resolve_integration_id(
                self.invoicing_integration_id,
                self.invoicing_provider_id,
            )
            .unwrap_or_default(),
            provider: self.provider,
            subtotal: self.subtotal,
            tax: self.tax,
            discount: self.discount,
            shipping_cost: self.shipping_cost,
            total_amount: self.total_amount,
            currency: self.currency,
            customer: CustomerSnapshot {
                name: self.customer_name,
                email: self.customer_email,
                phone: self.customer_phone,
                dni: self.customer_dni,
            },
            status: InvoiceStatus::from_string(&self.status),
            external_id: self.external_id,
            invoice_number: self.invoice_number,
            invoice_url: self.invoice_url,
            pdf_url: self.pdf_url,
            xml_url: self.xml_url,
            cufe: self.cufe,
            provider_response: self.provider_response.map(|j| j.0),
            metadata: self.metadata.0,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
            issued_utc: self.issued_utc,
            cancelled_utc: self.cancelled_utc,
            expires_utc: self.expires_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: Uuid,
    invoice_id: Uuid,
    product_id: Option<Uuid>,
    sku: String,
    name: String,
    description: Option<String>,
    quantity: i32,
    unit_price: Decimal,
    total_price: Decimal,
    currency: String,
    tax: Decimal,
    tax_rate: Option<Decimal>,
    discount: Decimal,
}

impl From<ItemRow> for InvoiceItem {
    fn from(row: ItemRow) -> Self {
        InvoiceItem {
            item_id: row.item_id,
            invoice_id: row.invoice_id,
            product_id: row.product_id,
            sku: row.sku,
            name: row.name,
            description: row.description,
            quantity: row.quantity,
            unit_price: row.unit_price,
            total_price: row.total_price,
            currency: row.currency,
            tax: row.tax,
            tax_rate: row.tax_rate,
            discount: row.discount,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    total: i64,
    draft: i64,
    pending: i64,
    issued: i64,
    failed: i64,
    cancelled: i64,
    issued_amount: Decimal,
}

#[derive(sqlx::FromRow)]
struct TrendRow {
    day: NaiveDate,
    created: i64,
    issued: i64,
    failed: i64,
    issued_amount: Decimal,
}

#[async_trait]
impl InvoiceRepository for Database {
    #[instrument(skip(self, invoice, items, first_attempt), fields(order_id = %invoice.order_id, integration_id = %invoice.invoicing_integration_id))]
    async fn create_invoice_with_items(
        &self,
        invoice: &NewInvoice,
        items: &[NewInvoiceItem],
        first_attempt: &NewSyncLog,
        bulk_item_id: Option<Uuid>,
    ) -> StoreResult<CreatedInvoice> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice_with_items"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT invoice_id FROM invoices
            WHERE order_id = $1
              AND COALESCE(invoicing_integration_id, invoicing_provider_id) = $2
              AND deleted_utc IS NULL
            "#,
        )
        .bind(invoice.order_id)
        .bind(invoice.invoicing_integration_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("check existing invoice", e))?;

        if existing.is_some() {
            return Err(InvoicingError::OrderAlreadyInvoiced(invoice.order_id));
        }

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            INSERT INTO invoices (
                invoice_id, business_id, order_id, invoicing_integration_id, provider,
                subtotal, tax, discount, shipping_cost, total_amount, currency,
                customer_name, customer_email, customer_phone, customer_dni, status, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 'pending', $16)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.business_id)
        .bind(invoice.order_id)
        .bind(invoice.invoicing_integration_id)
        .bind(&invoice.provider)
        .bind(invoice.subtotal)
        .bind(invoice.tax)
        .bind(invoice.discount)
        .bind(invoice.shipping_cost)
        .bind(invoice.total_amount)
        .bind(&invoice.currency)
        .bind(&invoice.customer.name)
        .bind(&invoice.customer.email)
        .bind(&invoice.customer.phone)
        .bind(&invoice.customer.dni)
        .bind(Json(&invoice.metadata))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                InvoicingError::OrderAlreadyInvoiced(invoice.order_id)
            }
            _ => db_error("create invoice", e),
        })?;

        let created = row.into_invoice();
        let mut lines = Vec::with_capacity(items.len());

        for (line_number, item) in items.iter().enumerate() {
            let item_row = sqlx::query_as::<_, ItemRow>(&format!(
                r#"
                INSERT INTO invoice_items (
                    item_id, invoice_id, product_id, sku, name, description, quantity,
                    unit_price, total_price, currency, tax, tax_rate, discount, line_number
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                RETURNING {ITEM_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(created.invoice_id)
            .bind(item.product_id)
            .bind(&item.sku)
            .bind(&item.name)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total_price)
            .bind(&item.currency)
            .bind(item.tax)
            .bind(item.tax_rate)
            .bind(item.discount)
            .bind(line_number as i32 + 1)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("create invoice item", e))?;
            lines.push(InvoiceItem::from(item_row));
        }

        let attempt = insert_sync_log_row(
            &mut *tx,
            &NewSyncLog {
                invoice_id: created.invoice_id,
                ..first_attempt.clone()
            },
        )
        .await
        .map_err(|e| db_error("insert first attempt", e))?;

        if let Some(item_id) = bulk_item_id {
            sqlx::query(
                r#"
                UPDATE bulk_invoice_job_items
                SET invoice_id = $2
                WHERE item_id = $1 AND status = 'processing'
                "#,
            )
            .bind(item_id)
            .bind(created.invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("link bulk item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit invoice", e))?;

        timer.observe_duration();

        info!(invoice_id = %created.invoice_id, items = lines.len(), sync_log_id = %attempt.sync_log_id, "Invoice created");

        Ok(CreatedInvoice {
            invoice: created,
            items: lines,
            attempt,
        })
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1 AND deleted_utc IS NULL"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))?;

        timer.observe_duration();

        Ok(row.map(InvoiceRow::into_invoice))
    }

    #[instrument(skip(self))]
    async fn get_invoice_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_items"])
            .start_timer();

        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM invoice_items WHERE invoice_id = $1 ORDER BY line_number"
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get invoice items", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(InvoiceItem::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_invoices_by_order(&self, order_id: Uuid) -> StoreResult<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoices_by_order"])
            .start_timer();

        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE order_id = $1 AND deleted_utc IS NULL
            ORDER BY created_utc
            "#
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get invoices by order", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(InvoiceRow::into_invoice).collect())
    }

    #[instrument(skip(self))]
    async fn get_invoice_by_order_and_provider(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_by_order_and_provider"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE order_id = $1
              AND COALESCE(invoicing_integration_id, invoicing_provider_id) = $2
              AND deleted_utc IS NULL
            "#
        ))
        .bind(order_id)
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice by order and provider", e))?;

        timer.observe_duration();

        Ok(row.map(InvoiceRow::into_invoice))
    }

    #[instrument(skip(self))]
    async fn invoice_exists_for_order(
        &self,
        order_id: Uuid,
        integration_id: Uuid,
    ) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_exists_for_order"])
            .start_timer();

        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM invoices
                WHERE order_id = $1
                  AND COALESCE(invoicing_integration_id, invoicing_provider_id) = $2
                  AND deleted_utc IS NULL
            )
            "#,
        )
        .bind(order_id)
        .bind(integration_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("check invoice exists", e))?;

        timer.observe_duration();

        Ok(exists)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn update_invoice(&self, invoice: &Invoice) -> StoreResult<Invoice> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            UPDATE invoices
            SET status = $2,
                external_id = $3,
                invoice_number = $4,
                invoice_url = $5,
                pdf_url = $6,
                xml_url = $7,
                cufe = $8,
                provider_response = $9,
                metadata = $10,
                issued_utc = $11,
                cancelled_utc = $12,
                expires_utc = $13,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND deleted_utc IS NULL
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.status.as_str())
        .bind(&invoice.external_id)
        .bind(&invoice.invoice_number)
        .bind(&invoice.invoice_url)
        .bind(&invoice.pdf_url)
        .bind(&invoice.xml_url)
        .bind(&invoice.cufe)
        .bind(invoice.provider_response.as_ref().map(Json))
        .bind(Json(&invoice.metadata))
        .bind(invoice.issued_utc)
        .bind(invoice.cancelled_utc)
        .bind(invoice.expires_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("update invoice", e))?;

        timer.observe_duration();

        row.map(InvoiceRow::into_invoice)
            .ok_or(InvoicingError::InvoiceNotFound(invoice.invoice_id))
    }

    #[instrument(skip(self, issued))]
    async fn mark_invoice_issued(
        &self,
        invoice_id: Uuid,
        issued: &IssuedInvoice,
    ) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_issued"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'issued',
                external_id = $2,
                invoice_number = $3,
                invoice_url = $4,
                pdf_url = $5,
                xml_url = $6,
                cufe = $7,
                issued_utc = $8,
                provider_response = $9,
                updated_utc = NOW()
            WHERE invoice_id = $1
              AND status NOT IN ('issued', 'cancelled')
              AND deleted_utc IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(&issued.external_id)
        .bind(&issued.invoice_number)
        .bind(&issued.invoice_url)
        .bind(&issued.pdf_url)
        .bind(&issued.xml_url)
        .bind(&issued.cufe)
        .bind(issued.issued_utc)
        .bind(issued.provider_response.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark invoice issued", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, from))]
    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        from: &[InvoiceStatus],
        to: InvoiceStatus,
    ) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_invoice"])
            .start_timer();

        let from: Vec<&str> = from.iter().map(InvoiceStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $3,
                cancelled_utc = CASE WHEN $3 = 'cancelled' THEN NOW() ELSE cancelled_utc END,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = ANY($2) AND deleted_utc IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(&from)
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("transition invoice", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, filter), fields(business_id = ?filter.business_id))]
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> StoreResult<(Vec<Invoice>, i64)> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        const WHERE: &str = r#"
            WHERE deleted_utc IS NULL
              AND ($1::uuid IS NULL OR business_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR order_id = $3)
              AND ($4::date IS NULL OR created_utc::date >= $4)
              AND ($5::date IS NULL OR created_utc::date <= $5)
        "#;

        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices {WHERE} ORDER BY created_utc DESC LIMIT $6 OFFSET $7"
        ))
        .bind(filter.business_id)
        .bind(status)
        .bind(filter.order_id)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.limit())
        .bind(filter.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoices", e))?;

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM invoices {WHERE}"))
            .bind(filter.business_id)
            .bind(status)
            .bind(filter.order_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("count invoices", e))?;

        timer.observe_duration();

        Ok((rows.into_iter().map(InvoiceRow::into_invoice).collect(), total))
    }

    #[instrument(skip(self))]
    async fn get_issued_in_range(
        &self,
        business_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_issued_in_range"])
            .start_timer();

        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE business_id = $1
              AND status = 'issued'
              AND created_utc BETWEEN $2 AND $3
              AND deleted_utc IS NULL
            ORDER BY invoice_number
            "#
        ))
        .bind(business_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get issued invoices in range", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(InvoiceRow::into_invoice).collect())
    }

    #[instrument(skip(self))]
    async fn invoice_summary(
        &self,
        business_id: Option<Uuid>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<InvoiceSummary> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_summary"])
            .start_timer();

        let row = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'draft') AS draft,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'issued') AS issued,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COALESCE(SUM(total_amount) FILTER (WHERE status = 'issued'), 0) AS issued_amount
            FROM invoices
            WHERE deleted_utc IS NULL
              AND ($1::uuid IS NULL OR business_id = $1)
              AND ($2::date IS NULL OR created_utc::date >= $2)
              AND ($3::date IS NULL OR created_utc::date <= $3)
            "#,
        )
        .bind(business_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("summarize invoices", e))?;

        timer.observe_duration();

        Ok(InvoiceSummary {
            total: row.total,
            draft: row.draft,
            pending: row.pending,
            issued: row.issued,
            failed: row.failed,
            cancelled: row.cancelled,
            issued_amount: row.issued_amount,
        })
    }

    #[instrument(skip(self))]
    async fn invoice_trends(
        &self,
        business_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<TrendPoint>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_trends"])
            .start_timer();

        let rows = sqlx::query_as::<_, TrendRow>(
            r#"
            SELECT
                created_utc::date AS day,
                COUNT(*) AS created,
                COUNT(*) FILTER (WHERE status = 'issued') AS issued,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COALESCE(SUM(total_amount) FILTER (WHERE status = 'issued'), 0) AS issued_amount
            FROM invoices
            WHERE deleted_utc IS NULL
              AND ($1::uuid IS NULL OR business_id = $1)
              AND created_utc::date BETWEEN $2 AND $3
            GROUP BY created_utc::date
            ORDER BY day
            "#,
        )
        .bind(business_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("compute invoice trends", e))?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|r| TrendPoint {
                day: r.day,
                created: r.created,
                issued: r.issued,
                failed: r.failed,
                issued_amount: r.issued_amount,
            })
            .collect())
    }
}
