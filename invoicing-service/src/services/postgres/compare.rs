//! Compare request persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::models::{CompareRequest, CompareStatus};
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{CompareRepository, StoreResult};

#[derive(sqlx::FromRow)]
struct CompareRow {
    correlation_id: Uuid,
    business_id: Uuid,
    date_from: DateTime<Utc>,
    date_to: DateTime<Utc>,
    status: String,
    requested_by: Option<Uuid>,
    created_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
}

#[async_trait]
impl CompareRepository for Database {
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id))]
    async fn insert_compare_request(&self, request: &CompareRequest) -> StoreResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_compare_request"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO compare_requests (
                correlation_id, business_id, date_from, date_to, status, requested_by, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.correlation_id)
        .bind(request.business_id)
        .bind(request.date_from)
        .bind(request.date_to)
        .bind(request.status.as_str())
        .bind(request.requested_by)
        .bind(request.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert compare request", e))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_compare_request(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<Option<CompareRequest>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_compare_request"])
            .start_timer();

        let row = sqlx::query_as::<_, CompareRow>(
            r#"
            SELECT correlation_id, business_id, date_from, date_to, status, requested_by,
                   created_utc, completed_utc
            FROM compare_requests
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get compare request", e))?;

        timer.observe_duration();

        Ok(row.map(|r| CompareRequest {
            correlation_id: r.correlation_id,
            business_id: r.business_id,
            date_from: r.date_from,
            date_to: r.date_to,
            status: CompareStatus::from_string(&r.status),
            requested_by: r.requested_by,
            created_utc: r.created_utc,
            completed_utc: r.completed_utc,
        }))
    }

    #[instrument(skip(self))]
    async fn complete_compare_request(&self, correlation_id: Uuid) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_compare_request"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE compare_requests
            SET status = 'completed', completed_utc = NOW()
            WHERE correlation_id = $1 AND status = 'pending'
            "#,
        )
        .bind(correlation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("complete compare request", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }
}
