//! Bulk job persistence. Counters only move through `counter = counter + n`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{BulkCounterDelta, BulkItemStatus, BulkJob, BulkJobItem, BulkJobStatus};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{BulkJobRepository, StoreResult};

const JOB_COLUMNS: &str = r#"
    job_id, business_id, created_by, total_orders, processed, successful, failed, status,
    error_message, created_utc, started_utc, completed_utc
"#;

const ITEM_COLUMNS: &str =
    "item_id, job_id, order_id, invoice_id, status, error_message, processed_utc";

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    business_id: Uuid,
    created_by: Option<Uuid>,
    total_orders: i32,
    processed: i32,
    successful: i32,
    failed: i32,
    status: String,
    error_message: Option<String>,
    created_utc: DateTime<Utc>,
    started_utc: Option<DateTime<Utc>>,
    completed_utc: Option<DateTime<Utc>>,
}

impl From<JobRow> for BulkJob {
    fn from(row: JobRow) -> Self {
        BulkJob {
            job_id: row.job_id,
            business_id: row.business_id,
            created_by: row.created_by,
            total_orders: row.total_orders,
            processed: row.processed,
            successful: row.successful,
            failed: row.failed,
            status: BulkJobStatus::from_string(&row.status),
            error_message: row.error_message,
            created_utc: row.created_utc,
            started_utc: row.started_utc,
            completed_utc: row.completed_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: Uuid,
    job_id: Uuid,
    order_id: Uuid,
    invoice_id: Option<Uuid>,
    status: String,
    error_message: Option<String>,
    processed_utc: Option<DateTime<Utc>>,
}

impl From<ItemRow> for BulkJobItem {
    fn from(row: ItemRow) -> Self {
        BulkJobItem {
            item_id: row.item_id,
            job_id: row.job_id,
            order_id: row.order_id,
            invoice_id: row.invoice_id,
            status: BulkItemStatus::from_string(&row.status),
            error_message: row.error_message,
            processed_utc: row.processed_utc,
        }
    }
}

#[async_trait]
impl BulkJobRepository for Database {
    #[instrument(skip(self, order_ids), fields(business_id = %business_id, orders = order_ids.len()))]
    async fn create_bulk_job(
        &self,
        business_id: Uuid,
        created_by: Option<Uuid>,
        order_ids: &[Uuid],
    ) -> StoreResult<(BulkJob, Vec<BulkJobItem>)> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_bulk_job"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let job = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO bulk_invoice_jobs (job_id, business_id, created_by, total_orders, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(business_id)
        .bind(created_by)
        .bind(order_ids.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("create bulk job", e))?;

        let item_ids: Vec<Uuid> = order_ids.iter().map(|_| Uuid::new_v4()).collect();
        let items = sqlx::query_as::<_, ItemRow>(&format!(
            r#"
            INSERT INTO bulk_invoice_job_items (item_id, job_id, order_id, status)
            SELECT item_id, $1, order_id, 'pending'
            FROM UNNEST($2::uuid[], $3::uuid[]) AS t(item_id, order_id)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(job.job_id)
        .bind(&item_ids)
        .bind(order_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                InvoicingError::InvalidInput("order ids must be unique".to_string())
            }
            _ => db_error("create bulk job items", e),
        })?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit bulk job", e))?;

        timer.observe_duration();

        info!(job_id = %job.job_id, total = job.total_orders, "Bulk job created");

        Ok((job.into(), items.into_iter().map(BulkJobItem::from).collect()))
    }

    #[instrument(skip(self))]
    async fn get_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_bulk_job"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM bulk_invoice_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get bulk job", e))?;

        timer.observe_duration();

        Ok(row.map(BulkJob::from))
    }

    #[instrument(skip(self))]
    async fn list_bulk_jobs(
        &self,
        business_id: Option<Uuid>,
        page: i64,
        page_size: i64,
    ) -> StoreResult<(Vec<BulkJob>, i64)> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_bulk_jobs"])
            .start_timer();

        let limit = page_size.clamp(1, 100);
        let offset = (page.max(1) - 1) * limit;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM bulk_invoice_jobs
            WHERE ($1::uuid IS NULL OR business_id = $1)
            ORDER BY created_utc DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(business_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list bulk jobs", e))?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bulk_invoice_jobs WHERE ($1::uuid IS NULL OR business_id = $1)",
        )
        .bind(business_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count bulk jobs", e))?;

        timer.observe_duration();

        Ok((rows.into_iter().map(BulkJob::from).collect(), total))
    }

    #[instrument(skip(self))]
    async fn get_bulk_job_items(&self, job_id: Uuid) -> StoreResult<Vec<BulkJobItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_bulk_job_items"])
            .start_timer();

        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM bulk_invoice_job_items WHERE job_id = $1 ORDER BY order_id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get bulk job items", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(BulkJobItem::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_bulk_item(&self, job_id: Uuid, order_id: Uuid) -> StoreResult<Option<BulkJobItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_bulk_item"])
            .start_timer();

        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM bulk_invoice_job_items WHERE job_id = $1 AND order_id = $2"
        ))
        .bind(job_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get bulk item", e))?;

        timer.observe_duration();

        Ok(row.map(BulkJobItem::from))
    }

    #[instrument(skip(self))]
    async fn get_bulk_item_by_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<BulkJobItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_bulk_item_by_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, ItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM bulk_invoice_job_items
            WHERE invoice_id = $1
            ORDER BY processed_utc DESC NULLS LAST
            LIMIT 1
            "#
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get bulk item by invoice", e))?;

        timer.observe_duration();

        Ok(row.map(BulkJobItem::from))
    }

    #[instrument(skip(self))]
    async fn mark_bulk_job_processing(&self, job_id: Uuid) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_bulk_job_processing"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bulk_invoice_jobs
            SET status = 'processing', started_utc = COALESCE(started_utc, NOW())
            WHERE job_id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark bulk job processing", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, from, error_message))]
    async fn transition_bulk_item(
        &self,
        item_id: Uuid,
        from: &[BulkItemStatus],
        to: BulkItemStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_bulk_item"])
            .start_timer();

        let from: Vec<&str> = from.iter().map(BulkItemStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE bulk_invoice_job_items
            SET status = $3,
                invoice_id = COALESCE($4, invoice_id),
                error_message = COALESCE($5, error_message),
                processed_utc = CASE WHEN $6 THEN NOW() ELSE processed_utc END
            WHERE item_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(item_id)
        .bind(&from)
        .bind(to.as_str())
        .bind(invoice_id)
        .bind(error_message)
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("transition bulk item", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn increment_bulk_counters(
        &self,
        job_id: Uuid,
        delta: BulkCounterDelta,
    ) -> StoreResult<BulkJob> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_bulk_counters"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE bulk_invoice_jobs
            SET processed = LEAST(processed + $2, total_orders),
                successful = successful + $3,
                failed = failed + $4
            WHERE job_id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(delta.processed)
        .bind(delta.successful)
        .bind(delta.failed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("increment bulk counters", e))?;

        timer.observe_duration();

        row.map(BulkJob::from)
            .ok_or(InvoicingError::BulkJobNotFound(job_id))
    }

    #[instrument(skip(self))]
    async fn complete_bulk_job(&self, job_id: Uuid) -> StoreResult<Option<BulkJob>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_bulk_job"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE bulk_invoice_jobs
            SET status = 'completed', completed_utc = NOW()
            WHERE job_id = $1
              AND status <> 'completed'
              AND successful + failed >= total_orders
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("complete bulk job", e))?;

        timer.observe_duration();

        if let Some(ref job) = row {
            info!(job_id = %job.job_id, successful = job.successful, failed = job.failed, "Bulk job completed");
        }

        Ok(row.map(BulkJob::from))
    }
}
