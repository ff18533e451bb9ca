//! Identity provider client: refresh-token grant and revocation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RefreshConfig;

/// Errors talking to the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The request never got an HTTP response.
    #[error("Identity provider unreachable: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("Identity provider returned HTTP {status}{}", code_suffix(.error_code))]
    Status {
        /// HTTP status code
        status: u16,
        /// OAuth `error` field
        error_code: Option<String>,
        /// OAuth `error_description` field
        description: Option<String>,
    },

    /// The success response could not be parsed.
    #[error("Invalid identity provider response: {0}")]
    InvalidResponse(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

/// Token endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// New access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// New ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// New refresh token, when rotated
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Upstream identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Exchange a refresh token for a new token set.
    async fn refresh_grant(&self, refresh_token: &str, scope: &str) -> Result<TokenResponse, UpstreamError>;

    /// Revoke a refresh token.
    async fn revoke(&self, refresh_token: &str) -> Result<(), UpstreamError>;
}

/// OAuth 2.0 provider over HTTP form posts.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: RefreshConfig,
}

impl HttpIdentityProvider {
    /// Create a client for the configured endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: RefreshConfig) -> crate::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(config.request_timeout).build()?,
            config,
        })
    }

    fn client_params<'a>(&'a self, params: &mut HashMap<&'static str, &'a str>) {
        params.insert("client_id", &self.config.client_id);
        if let Some(secret) = &self.config.client_secret {
            params.insert("client_secret", secret);
        }
    }

    async fn post(&self, url: &str, params: &HashMap<&'static str, &str>) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<OAuthErrorBody>(&body).ok();
        Err(UpstreamError::Status {
            status,
            error_code: parsed.as_ref().and_then(|b| b.error.clone()),
            description: parsed.and_then(|b| b.error_description),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn refresh_grant(&self, refresh_token: &str, scope: &str) -> Result<TokenResponse, UpstreamError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("scope", scope);
        self.client_params(&mut params);

        let response = self.post(&self.config.token_endpoint, &params).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), UpstreamError> {
        let Some(endpoint) = &self.config.revoke_endpoint else {
            debug!("No revocation endpoint configured, skipping upstream revoke");
            return Ok(());
        };

        let mut params = HashMap::new();
        params.insert("token", refresh_token);
        params.insert("token_type_hint", "refresh_token");
        self.client_params(&mut params);

        self.post(endpoint, &params).await.map(|_| ())
    }
}
