//! Upstream token endpoint client.
//!
//! All calls go through [`SsrfGuard::fetch`] so the token endpoint is held to
//! the same address and size rules as any other outbound request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::models::UpstreamTokens;
use crate::config::{ProxyConfig, UpstreamAuthMethod};
use crate::error::{OAuthError, OAuthResult};
use crate::ssrf::{OutboundRequest, SsrfGuard};

/// Operations against the upstream token endpoint.
#[async_trait]
pub trait UpstreamTokenClient: Send + Sync {
    /// `grant_type=authorization_code`
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> OAuthResult<UpstreamTokens>;

    /// `grant_type=refresh_token`
    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> OAuthResult<UpstreamTokens>;
}

/// [`UpstreamTokenClient`] over HTTP.
pub struct HttpUpstreamClient {
    guard: SsrfGuard,
    token_endpoint: String,
    client_id: String,
    client_secret: SecretString,
    auth_method: UpstreamAuthMethod,
    extra_params: BTreeMap<String, String>,
    max_response_size: usize,
}

impl HttpUpstreamClient {
    /// Client using the configured endpoint, credentials, and SSRF policy.
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::with_guard(config, SsrfGuard::new(config.ssrf_policy.clone()))
    }

    /// Client sending through a caller-supplied guard.
    #[must_use]
    pub fn with_guard(config: &ProxyConfig, guard: SsrfGuard) -> Self {
        Self {
            guard,
            token_endpoint: config.upstream_token_endpoint.clone(),
            client_id: config.upstream_client_id.clone(),
            client_secret: config.upstream_client_secret.clone(),
            auth_method: config.upstream_auth_method,
            extra_params: config.extra_token_params.clone(),
            max_response_size: config.upstream_max_response_size,
        }
    }

    async fn token_request(&self, grant: &[(&str, &str)]) -> OAuthResult<UpstreamTokens> {
        let mut params: Vec<(&str, &str)> = grant.to_vec();
        params.extend(self.extra_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if self.auth_method == UpstreamAuthMethod::ClientSecretPost {
            params.push(("client_id", self.client_id.as_str()));
            params.push(("client_secret", self.client_secret.expose_secret().as_str()));
        }

        let mut request = OutboundRequest::post_form(&self.token_endpoint, params)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .max_size(self.max_response_size);
        if self.auth_method == UpstreamAuthMethod::ClientSecretBasic {
            request = request.header(AUTHORIZATION, self.basic_auth()?);
        }

        let response = self.guard.fetch(request).await?;
        let body: Value = response.json().map_err(|e| {
            tracing::warn!(
                status = response.status,
                error = %e,
                "Upstream token response is not JSON"
            );
            OAuthError::upstream(response.status, "invalid token response")
        })?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            let description =
                body.get("error_description").and_then(Value::as_str).unwrap_or(error);
            tracing::warn!(
                status = response.status,
                error,
                "Upstream token endpoint returned an error"
            );
            return Err(match error {
                "invalid_grant" => OAuthError::invalid_grant(description),
                _ => OAuthError::upstream(response.status, error),
            });
        }
        if !response.is_success() {
            tracing::warn!(status = response.status, "Upstream token endpoint failed");
            return Err(OAuthError::upstream(response.status, "token request failed"));
        }

        serde_json::from_value(body).map_err(|e| {
            tracing::warn!(error = %e, "Upstream token response missing fields");
            OAuthError::upstream(response.status, "invalid token response")
        })
    }

    /// RFC 6749 §2.3.1: credentials are form-encoded before Base64.
    fn basic_auth(&self) -> OAuthResult<HeaderValue> {
        let encode =
            |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let credentials = format!(
            "{}:{}",
            encode(self.client_id.as_str()),
            encode(self.client_secret.expose_secret().as_str())
        );
        let mut value = HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials)))
            .map_err(|e| OAuthError::upstream(0, e.to_string()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait]
impl UpstreamTokenClient for HttpUpstreamClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> OAuthResult<UpstreamTokens> {
        let mut grant = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = code_verifier {
            grant.push(("code_verifier", verifier));
        }
        self.token_request(&grant).await
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> OAuthResult<UpstreamTokens> {
        let scope = scopes.join(" ");
        let mut grant = vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        if !scope.is_empty() {
            grant.push(("scope", scope.as_str()));
        }
        self.token_request(&grant).await
    }
}

impl std::fmt::Debug for HttpUpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstreamClient")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("auth_method", &self.auth_method)
            .finish()
    }
}
