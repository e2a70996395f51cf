//! Retry ledger persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgExecutor;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    NewSyncLog, SyncLog, SyncLogCompletion, SyncOperation, SyncStatus, TriggerSource,
};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{StoreResult, SyncLogRepository};

const SYNC_LOG_COLUMNS: &str = r#"
    sync_log_id, invoice_id, operation, status, correlation_id, request_url, request_payload,
    response_status, response_body, error_message, error_code, error_details, retry_count,
    max_retries, next_retry_utc, retried_utc, trigger_source, user_id, started_utc,
    completed_utc, duration_ms, created_utc
"#;

#[derive(sqlx::FromRow)]
struct SyncLogRow {
    sync_log_id: Uuid,
    invoice_id: Uuid,
    operation: String,
    status: String,
    correlation_id: Uuid,
    request_url: Option<String>,
    request_payload: Option<Json<serde_json::Value>>,
    response_status: Option<i32>,
    response_body: Option<Json<serde_json::Value>>,
    error_message: Option<String>,
    error_code: Option<String>,
    error_details: Option<Json<serde_json::Value>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_utc: Option<DateTime<Utc>>,
    retried_utc: Option<DateTime<Utc>>,
    trigger_source: String,
    user_id: Option<Uuid>,
    started_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    created_utc: DateTime<Utc>,
}

impl From<SyncLogRow> for SyncLog {
    fn from(row: SyncLogRow) -> Self {
        SyncLog {
            sync_log_id: row.sync_log_id,
            invoice_id: row.invoice_id,
            operation: SyncOperation::from_string(&row.operation),
            status: SyncStatus::from_string(&row.status),
            correlation_id: row.correlation_id,
            request_url: row.request_url,
            request_payload: row.request_payload.map(|j| j.0),
            response_status: row.response_status,
            response_body: row.response_body.map(|j| j.0),
            error_message: row.error_message,
            error_code: row.error_code,
            error_details: row.error_details.map(|j| j.0),
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_retry_utc: row.next_retry_utc,
            retried_utc: row.retried_utc,
            trigger: TriggerSource::from_string(&row.trigger_source),
            user_id: row.user_id,
            started_utc: row.started_utc,
            completed_utc: row.completed_utc,
            duration_ms: row.duration_ms,
            created_utc: row.created_utc,
        }
    }
}

/// Insert one attempt through any executor, pool or open transaction.
pub(super) async fn insert_sync_log_row<'e, E>(
    executor: E,
    input: &NewSyncLog,
) -> Result<SyncLog, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, SyncLogRow>(&format!(
        r#"
        INSERT INTO invoice_sync_logs (
            sync_log_id, invoice_id, operation, status, correlation_id, request_url,
            request_payload, retry_count, max_retries, trigger_source, user_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {SYNC_LOG_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(input.invoice_id)
    .bind(input.operation.as_str())
    .bind(input.status.as_str())
    .bind(input.correlation_id)
    .bind(&input.request_url)
    .bind(input.request_payload.as_ref().map(Json))
    .bind(input.retry_count)
    .bind(input.max_retries)
    .bind(input.trigger.as_str())
    .bind(input.user_id)
    .fetch_one(executor)
    .await?;

    Ok(row.into())
}

#[async_trait]
impl SyncLogRepository for Database {
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id, correlation_id = %input.correlation_id, operation = input.operation.as_str()))]
    async fn insert_sync_log(&self, input: &NewSyncLog) -> StoreResult<SyncLog> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_sync_log"])
            .start_timer();

        let log = insert_sync_log_row(&self.pool, input)
            .await
            .map_err(|e| db_error("insert sync log", e))?;

        timer.observe_duration();

        Ok(log)
    }

    #[instrument(skip(self))]
    async fn get_sync_logs(&self, invoice_id: Uuid) -> StoreResult<Vec<SyncLog>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_sync_logs"])
            .start_timer();

        let rows = sqlx::query_as::<_, SyncLogRow>(&format!(
            r#"
            SELECT {SYNC_LOG_COLUMNS} FROM invoice_sync_logs
            WHERE invoice_id = $1
            ORDER BY created_utc, retry_count
            "#
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get sync logs", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(SyncLog::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_latest_sync_log(&self, invoice_id: Uuid) -> StoreResult<Option<SyncLog>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_latest_sync_log"])
            .start_timer();

        let row = sqlx::query_as::<_, SyncLogRow>(&format!(
            r#"
            SELECT {SYNC_LOG_COLUMNS} FROM invoice_sync_logs
            WHERE invoice_id = $1
            ORDER BY created_utc DESC, retry_count DESC
            LIMIT 1
            "#
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get latest sync log", e))?;

        timer.observe_duration();

        Ok(row.map(SyncLog::from))
    }

    #[instrument(skip(self))]
    async fn get_sync_log_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<Option<SyncLog>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_sync_log_by_correlation"])
            .start_timer();

        let row = sqlx::query_as::<_, SyncLogRow>(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM invoice_sync_logs WHERE correlation_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get sync log by correlation", e))?;

        timer.observe_duration();

        Ok(row.map(SyncLog::from))
    }

    #[instrument(skip(self, completion), fields(status = completion.status.as_str()))]
    async fn complete_sync_log(
        &self,
        sync_log_id: Uuid,
        completion: &SyncLogCompletion,
    ) -> StoreResult<SyncLog> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_sync_log"])
            .start_timer();

        let audit = &completion.audit;
        let row = sqlx::query_as::<_, SyncLogRow>(&format!(
            r#"
            UPDATE invoice_sync_logs
            SET status = $2,
                error_message = $3,
                error_code = $4,
                error_details = $5,
                next_retry_utc = $6,
                request_url = COALESCE($7, request_url),
                request_payload = COALESCE($8, request_payload),
                response_status = $9,
                response_body = $10,
                completed_utc = $11,
                duration_ms = $12
            WHERE sync_log_id = $1
            RETURNING {SYNC_LOG_COLUMNS}
            "#
        ))
        .bind(sync_log_id)
        .bind(completion.status.as_str())
        .bind(&completion.error_message)
        .bind(&completion.error_code)
        .bind(completion.error_details.as_ref().map(Json))
        .bind(completion.next_retry_utc)
        .bind(&audit.request_url)
        .bind(audit.request_payload.as_ref().map(Json))
        .bind(audit.response_status)
        .bind(audit.response_body.as_ref().map(Json))
        .bind(completion.completed_utc)
        .bind(completion.duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("complete sync log", e))?;

        timer.observe_duration();

        row.map(SyncLog::from).ok_or_else(|| {
            InvoicingError::Infrastructure(service_core::error::AppError::NotFound(
                anyhow::anyhow!("sync log {} vanished", sync_log_id),
            ))
        })
    }

    #[instrument(skip(self))]
    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<SyncLog>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_due_retries"])
            .start_timer();

        let rows = sqlx::query_as::<_, SyncLogRow>(
            r#"
            WITH due AS (
                SELECT sync_log_id FROM invoice_sync_logs
                WHERE status = 'failed'
                  AND retry_count < max_retries
                  AND next_retry_utc IS NOT NULL
                  AND next_retry_utc <= $1
                  AND retried_utc IS NULL
                ORDER BY next_retry_utc
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE invoice_sync_logs s
            SET retried_utc = $1
            FROM due
            WHERE s.sync_log_id = due.sync_log_id
            RETURNING s.*
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("claim due retries", e))?;

        timer.observe_duration();

        if !rows.is_empty() {
            info!(claimed = rows.len(), "Claimed due retries");
        }

        Ok(rows.into_iter().map(SyncLog::from).collect())
    }

    #[instrument(skip(self))]
    async fn release_retry_claim(&self, sync_log_id: Uuid) -> StoreResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_retry_claim"])
            .start_timer();

        sqlx::query(
            "UPDATE invoice_sync_logs SET retried_utc = NULL WHERE sync_log_id = $1 AND status = 'failed'",
        )
        .bind(sync_log_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("release retry claim", e))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_scheduled_retries(&self, invoice_id: Uuid) -> StoreResult<u64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_scheduled_retries"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoice_sync_logs
            SET status = 'cancelled', next_retry_utc = NULL
            WHERE invoice_id = $1
              AND status IN ('pending', 'processing', 'failed')
              AND retried_utc IS NULL
              AND (status <> 'failed' OR next_retry_utc IS NOT NULL)
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("cancel scheduled retries", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn retry_backlog(&self, business_id: Option<Uuid>) -> StoreResult<(i64, i64)> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["retry_backlog"])
            .start_timer();

        let backlog: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE s.next_retry_utc IS NOT NULL AND s.retried_utc IS NULL),
                COUNT(*) FILTER (WHERE s.retry_count >= s.max_retries AND i.status = 'failed')
            FROM invoice_sync_logs s
            JOIN invoices i ON i.invoice_id = s.invoice_id
            WHERE s.status = 'failed'
              AND i.deleted_utc IS NULL
              AND ($1::uuid IS NULL OR i.business_id = $1)
            "#,
        )
        .bind(business_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count retry backlog", e))?;

        timer.observe_duration();

        Ok(backlog)
    }
}
