use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::dtos::{
    validated, BulkCreateRequest, BulkCreateResponse, BulkJobResponse, PageQuery, PageResponse,
};
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::models::BulkJob;
use crate::startup::AppState;

#[tracing::instrument(skip(state, ctx, body), fields(business_id = %ctx.business_id, orders = body.order_ids.len()))]
pub async fn create_bulk(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Json(body): Json<BulkCreateRequest>,
) -> Result<(StatusCode, Json<BulkCreateResponse>), InvoicingError> {
    let job = state
        .bulk
        .create_bulk(ctx.business_id, ctx.user_id, &body.order_ids)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkCreateResponse {
            job_id: job.job_id,
            status: job.status.as_str().to_string(),
            total_orders: job.total_orders,
            status_url: format!("/api/v1/invoicing/bulk-jobs/{}", job.job_id),
        }),
    ))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Query(query): Query<PageQuery>,
) -> Result<Json<PageResponse<BulkJob>>, InvoicingError> {
    let query = validated(query)?;
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(20);
    let (data, total) = state.bulk.list(ctx.scope(), page, page_size).await?;
    Ok(Json(PageResponse {
        data,
        total,
        page,
        page_size,
    }))
}

pub async fn get_job(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<BulkJobResponse>, InvoicingError> {
    let (job, items) = state.bulk.get_status(job_id, ctx.scope()).await?;
    Ok(Json(BulkJobResponse {
        progress_percent: job.progress_percent(),
        job,
        items,
    }))
}
