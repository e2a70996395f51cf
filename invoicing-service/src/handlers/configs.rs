use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::dtos::{validated, AutoInvoiceRequest, CreateConfigRequest, UpdateConfigRequest};
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::models::InvoicingConfig;
use crate::startup::AppState;

#[tracing::instrument(skip(state, ctx, body), fields(business_id = %ctx.business_id))]
pub async fn create_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Json(body): Json<CreateConfigRequest>,
) -> Result<(StatusCode, Json<InvoicingConfig>), InvoicingError> {
    let input = validated(body)?.into_new(
        ctx.business_id,
        ctx.user_id,
        state.configs.default_max_retries(),
    );
    let config = state.configs.create(input).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn list_configs(
    State(state): State<AppState>,
    ctx: BusinessContext,
) -> Result<Json<Vec<InvoicingConfig>>, InvoicingError> {
    Ok(Json(state.configs.list(ctx.scope()).await?))
}

pub async fn get_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
) -> Result<Json<InvoicingConfig>, InvoicingError> {
    Ok(Json(state.configs.get(config_id, ctx.scope()).await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
    Json(body): Json<UpdateConfigRequest>,
) -> Result<Json<InvoicingConfig>, InvoicingError> {
    let update = validated(body)?.into();
    Ok(Json(
        state.configs.update(config_id, ctx.scope(), update).await?,
    ))
}

pub async fn delete_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
) -> Result<StatusCode, InvoicingError> {
    state.configs.delete(config_id, ctx.scope()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
) -> Result<Json<InvoicingConfig>, InvoicingError> {
    Ok(Json(
        state.configs.set_enabled(config_id, ctx.scope(), true).await?,
    ))
}

pub async fn disable_config(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
) -> Result<Json<InvoicingConfig>, InvoicingError> {
    Ok(Json(
        state.configs.set_enabled(config_id, ctx.scope(), false).await?,
    ))
}

pub async fn set_auto_invoice(
    State(state): State<AppState>,
    ctx: BusinessContext,
    Path(config_id): Path<Uuid>,
    Json(body): Json<AutoInvoiceRequest>,
) -> Result<Json<InvoicingConfig>, InvoicingError> {
    Ok(Json(
        state
            .configs
            .set_auto_invoice(config_id, ctx.scope(), body.auto_invoice)
            .await?,
    ))
}
