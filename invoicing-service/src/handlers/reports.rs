use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{Duration, Utc};

use crate::dtos::DateRangeQuery;
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::models::{InvoiceStats, InvoiceSummary, TrendPoint};
use crate::startup::AppState;

/// Days covered by the trends view when no range is given.
const DEFAULT_TREND_DAYS: i64 = 30;

pub async fn summary(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<InvoiceSummary>, InvoicingError> {
    Ok(Json(
        state
            .invoicing
            .summary(ctx.scope(), range.start_date, range.end_date)
            .await?,
    ))
}

pub async fn stats(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<InvoiceStats>, InvoicingError> {
    Ok(Json(
        state
            .invoicing
            .stats(ctx.scope(), range.start_date, range.end_date)
            .await?,
    ))
}

pub async fn trends(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<Vec<TrendPoint>>, InvoicingError> {
    let end = range.end_date.unwrap_or_else(|| Utc::now().date_naive());
    let start = range
        .start_date
        .unwrap_or(end - Duration::days(DEFAULT_TREND_DAYS - 1));
    Ok(Json(
        state.invoicing.trends(ctx.scope(), start, end).await?,
    ))
}
