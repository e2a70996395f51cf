//! Softpymes API client.
//!
//! Only authentication lives here: document submission goes through the
//! provider router behind `invoicing.requests`. The client backs the
//! test-connection endpoint and keeps one bearer token per API key.

use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::config::SoftpymesConfig;
use crate::error::InvoicingError;
use crate::services::metrics::PROVIDER_REQUEST_DURATION;

const PROVIDER: &str = "softpymes";
const LOGIN_PATH: &str = "/oauth/integration/login/";
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire.
pub const TOKEN_REFRESH_MARGIN_MINS: i64 = 5;

#[derive(Clone)]
pub struct SoftpymesCredentials {
    pub api_key: String,
    pub api_secret: SecretString,
    pub referer: Option<String>,
}

impl std::fmt::Debug for SoftpymesCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftpymesCredentials")
            .field("api_key", &self.api_key)
            .field("referer", &self.referer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    api_key: &'a str,
    api_secret: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Clone)]
struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::minutes(TOKEN_REFRESH_MARGIN_MINS) < self.expires_at
    }
}

/// Result of a test-connection call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub provider: &'static str,
    pub token_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SoftpymesClient {
    client: Client,
    config: SoftpymesConfig,
    tokens: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl SoftpymesClient {
    pub fn new(config: SoftpymesConfig) -> Result<Self, InvoicingError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InvoicingError::Provider(e.to_string()))?;
        Ok(Self {
            client,
            config,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Credentials from the service configuration, when both halves are set.
    pub fn default_credentials(&self) -> Option<SoftpymesCredentials> {
        let api_key = self.config.api_key.as_ref()?;
        let api_secret = self.config.api_secret.clone()?;
        Some(SoftpymesCredentials {
            api_key: api_key.expose_secret().clone(),
            api_secret,
            referer: self.config.referer.clone(),
        })
    }

    /// Bearer token for `credentials`, served from cache until five minutes
    /// before expiry.
    pub async fn access_token(
        &self,
        credentials: &SoftpymesCredentials,
    ) -> Result<SecretString, InvoicingError> {
        let now = Utc::now();
        if let Some(cached) = self.tokens.read().await.get(&credentials.api_key) {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let mut tokens = self.tokens.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(cached) = tokens.get(&credentials.api_key) {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.login(credentials).await?;
        let token = fresh.token.clone();
        tokens.insert(credentials.api_key.clone(), fresh);
        Ok(token)
    }

    /// Drop the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self, api_key: &str) {
        self.tokens.write().await.remove(api_key);
    }

    #[instrument(skip(self, credentials), fields(component = "softpymes", api_key = %credentials.api_key))]
    pub async fn test_connection(
        &self,
        credentials: &SoftpymesCredentials,
    ) -> Result<ConnectionStatus, InvoicingError> {
        self.invalidate(&credentials.api_key).await;
        self.access_token(credentials).await?;
        let expires_at = self
            .tokens
            .read()
            .await
            .get(&credentials.api_key)
            .map(|t| t.expires_at)
            .ok_or_else(|| InvoicingError::TokenRefreshFailed("token was not cached".into()))?;

        info!(%expires_at, "Softpymes connection verified");
        Ok(ConnectionStatus {
            connected: true,
            provider: PROVIDER,
            token_expires_at: expires_at,
        })
    }

    async fn login(&self, credentials: &SoftpymesCredentials) -> Result<CachedToken, InvoicingError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), LOGIN_PATH);
        let body = LoginRequest {
            api_key: &credentials.api_key,
            api_secret: credentials.api_secret.expose_secret(),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(referer) = &credentials.referer {
            request = request.header(header::REFERER, referer);
        }

        let timer = PROVIDER_REQUEST_DURATION
            .with_label_values(&[PROVIDER, "login"])
            .start_timer();
        let response = request.send().await;
        timer.observe_duration();

        let response = response.map_err(|e| {
            warn!(error = %e, "Softpymes login request failed");
            InvoicingError::TokenRefreshFailed(e.to_string())
        })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = status.as_u16(), "Softpymes rejected credentials");
                return Err(InvoicingError::ProviderUnauthorized);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                warn!(?retry_after, "Softpymes rate limit hit");
                return Err(InvoicingError::RateLimited { retry_after });
            }
            s if !s.is_success() => {
                let text = response.text().await.unwrap_or_default();
                return Err(InvoicingError::TokenRefreshFailed(format!(
                    "login returned {}: {}",
                    s.as_u16(),
                    text
                )));
            }
            _ => {}
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| InvoicingError::TokenRefreshFailed(e.to_string()))?;
        let ttl = login
            .expires_in
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        Ok(CachedToken {
            token: SecretString::new(login.access_token),
            expires_at: Utc::now() + Duration::seconds(ttl),
        })
    }
}
