use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::dtos::{
    validated, CreateInvoiceRequest, InvoiceDetailResponse, ListInvoicesQuery, PageResponse,
    RetryAcceptedResponse, SyncLogsResponse,
};
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::models::{Invoice, TriggerSource};
use crate::services::{CancelOutcome, CreateInvoiceIntent};
use crate::startup::AppState;

#[tracing::instrument(skip(state, ctx, body), fields(business_id = %ctx.business_id))]
pub async fn create_invoice(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Json(body): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<Invoice>), InvoicingError> {
    let body = validated(body)?;
    let mut intent = CreateInvoiceIntent::manual(body.order_id, ctx.scope(), ctx.user_id);
    intent.invoicing_integration_id = body.invoicing_integration_id;

    let invoice = state.invoicing.create_invoice(intent).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<PageResponse<Invoice>>, InvoicingError> {
    let filter = validated(query)?.into_filter(ctx.scope());
    let (data, total) = state.invoicing.list_invoices(&filter).await?;
    Ok(Json(PageResponse {
        data,
        total,
        page: filter.page.max(1),
        page_size: filter.limit(),
    }))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDetailResponse>, InvoicingError> {
    let (invoice, items) = state.invoicing.get_invoice(invoice_id, ctx.scope()).await?;
    Ok(Json(InvoiceDetailResponse { invoice, items }))
}

/// 200 with the invoice when it was cancelled locally, 202 with the attempt
/// when the provider was asked to void it.
#[tracing::instrument(skip(state, ctx), fields(business_id = %ctx.business_id))]
pub async fn cancel_invoice(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Response, InvoicingError> {
    let outcome = state
        .invoicing
        .cancel_invoice(invoice_id, ctx.scope(), ctx.user_id)
        .await?;
    Ok(match outcome {
        CancelOutcome::Cancelled(invoice) => (StatusCode::OK, Json(invoice)).into_response(),
        CancelOutcome::Requested(attempt) => (
            StatusCode::ACCEPTED,
            Json(RetryAcceptedResponse::from(attempt)),
        )
            .into_response(),
    })
}

#[tracing::instrument(skip(state, ctx), fields(business_id = %ctx.business_id))]
pub async fn retry_invoice(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RetryAcceptedResponse>), InvoicingError> {
    let attempt = state
        .invoicing
        .retry_invoice(invoice_id, ctx.scope(), TriggerSource::Manual, ctx.user_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(attempt.into())))
}

pub async fn create_credit_note(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<StatusCode, InvoicingError> {
    state
        .invoicing
        .create_credit_note(invoice_id, ctx.scope())
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn sync_logs(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<SyncLogsResponse>, InvoicingError> {
    let sync_logs = state.invoicing.sync_logs(invoice_id, ctx.scope()).await?;
    Ok(Json(SyncLogsResponse {
        invoice_id,
        sync_logs,
    }))
}
