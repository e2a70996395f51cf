use axum::{extract::State, http::StatusCode, Json};

use crate::dtos::{validated, CompareAcceptedResponse, CompareRequestBody};
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::startup::AppState;

#[tracing::instrument(skip(state, ctx, body), fields(business_id = %ctx.business_id))]
pub async fn request_comparison(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Json(body): Json<CompareRequestBody>,
) -> Result<(StatusCode, Json<CompareAcceptedResponse>), InvoicingError> {
    let body = validated(body)?;
    let correlation_id = state
        .compare
        .request_comparison(
            ctx.business_id,
            &body.date_from,
            &body.date_to,
            body.hints,
            ctx.user_id,
        )
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CompareAcceptedResponse {
            correlation_id,
            status: "pending",
        }),
    ))
}
