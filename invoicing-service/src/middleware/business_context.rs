//! Caller identity supplied by the BFF.
//!
//! The BFF authenticates the user and forwards the business, user and scope
//! as headers. A missing or malformed business id is rejected with 401.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const BUSINESS_ID_HEADER: &str = "X-Business-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";
pub const SCOPE_ID_HEADER: &str = "X-Scope-ID";

/// Scope id of platform operators, who see every business.
pub const SUPER_ADMIN_SCOPE: i64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct BusinessContext {
    pub business_id: Uuid,
    pub user_id: Option<Uuid>,
    pub scope_id: Option<i64>,
}

impl BusinessContext {
    pub fn is_super_admin(&self) -> bool {
        self.scope_id == Some(SUPER_ADMIN_SCOPE)
    }

    /// Business filter for reads and ownership checks; `None` sees all.
    pub fn scope(&self) -> Option<Uuid> {
        if self.is_super_admin() {
            None
        } else {
            Some(self.business_id)
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for BusinessContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let business_id = header(parts, BUSINESS_ID_HEADER)
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing or invalid X-Business-ID header (required from BFF)"
                ))
            })?;

        let user_id = header(parts, USER_ID_HEADER).and_then(|v| Uuid::parse_str(v.trim()).ok());
        let scope_id = header(parts, SCOPE_ID_HEADER).and_then(|v| v.trim().parse().ok());

        let span = tracing::Span::current();
        span.record("business_id", tracing::field::display(business_id));
        if let Some(uid) = user_id {
            span.record("user_id", tracing::field::display(uid));
        }

        Ok(BusinessContext {
            business_id,
            user_id,
            scope_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(builder: axum::http::request::Builder) -> Result<BusinessContext, AppError> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        BusinessContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn missing_business_is_rejected() {
        let err = extract(Request::builder()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn super_admin_sees_every_business() {
        let business = Uuid::new_v4();
        let ctx = extract(
            Request::builder()
                .header(BUSINESS_ID_HEADER, business.to_string())
                .header(SCOPE_ID_HEADER, "1"),
        )
        .await
        .unwrap();
        assert!(ctx.is_super_admin());
        assert_eq!(ctx.scope(), None);

        let ctx = extract(
            Request::builder()
                .header(BUSINESS_ID_HEADER, business.to_string())
                .header(SCOPE_ID_HEADER, "2"),
        )
        .await
        .unwrap();
        assert_eq!(ctx.scope(), Some(business));
    }
}
