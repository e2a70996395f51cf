use axum::{extract::State, Json};
use secrecy::SecretString;

use crate::dtos::{validated, TestConnectionRequest};
use crate::error::InvoicingError;
use crate::middleware::BusinessContext;
use crate::services::{ConnectionStatus, SoftpymesCredentials};
use crate::startup::AppState;

/// Log in to Softpymes with the supplied credentials, or the service's own
/// when none are given.
#[tracing::instrument(skip(state, ctx, body), fields(business_id = %ctx.business_id))]
pub async fn test_softpymes_connection(
    State(state): State<AppState>,
    ctx: BusinessContext,
    body: Option<Json<TestConnectionRequest>>,
) -> Result<Json<ConnectionStatus>, InvoicingError> {
    let body = validated(body.map(|Json(b)| b).unwrap_or_default())?;

    let credentials = match (body.api_key, body.api_secret) {
        (Some(api_key), Some(api_secret)) => SoftpymesCredentials {
            api_key,
            api_secret: SecretString::new(api_secret),
            referer: body.referer,
        },
        (None, None) => state
            .softpymes
            .default_credentials()
            .ok_or(InvoicingError::MissingField("api_key"))?,
        (None, Some(_)) => return Err(InvoicingError::MissingField("api_key")),
        (Some(_), None) => return Err(InvoicingError::MissingField("api_secret")),
    };

    Ok(Json(state.softpymes.test_connection(&credentials).await?))
}
