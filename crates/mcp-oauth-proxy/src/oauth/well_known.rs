//! Path-aware discovery documents (RFC 8414 / RFC 9728).
//!
//! A proxy mounted under `https://host/api` publishes its authorization-server
//! metadata at `/.well-known/oauth-authorization-server/api` and its
//! protected-resource metadata at `/.well-known/oauth-protected-resource/api/mcp`.
//! Both live at the host root; the operational endpoints they advertise always
//! point at `base_url`.

use std::sync::Arc;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde::Serialize;
use url::Url;

use crate::config::ProxyConfig;

const AUTHORIZATION_SERVER_PREFIX: &str = "/.well-known/oauth-authorization-server";
const PROTECTED_RESOURCE_PREFIX: &str = "/.well-known/oauth-protected-resource";

/// RFC 8414 document.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: String,
    pub revocation_endpoint: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub revocation_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
}

/// RFC 9728 document.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<&'static str>,
}

/// Computes discovery paths and documents for one proxy deployment.
#[derive(Debug, Clone)]
pub struct WellKnownRouter {
    base_url: String,
    issuer_url: String,
    resource_url: String,
    scopes: Vec<String>,
}

impl WellKnownRouter {
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            issuer_url: config.issuer().trim_end_matches('/').to_string(),
            resource_url: format!("{}{}", config.base_url, config.mcp_path),
            scopes: config.required_scopes.clone(),
        }
    }

    /// Protected MCP endpoint URL.
    #[must_use]
    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }

    /// Host-root path of the authorization-server document. Unsuffixed when
    /// the issuer is root-level.
    #[must_use]
    pub fn authorization_server_metadata_path(&self) -> String {
        format!("{AUTHORIZATION_SERVER_PREFIX}{}", url_path(&self.issuer_url))
    }

    /// Host-root path of the protected-resource document.
    #[must_use]
    pub fn protected_resource_metadata_path(&self) -> String {
        format!("{PROTECTED_RESOURCE_PREFIX}{}", url_path(&self.resource_url))
    }

    /// Absolute URL of the protected-resource document, as advertised in
    /// `WWW-Authenticate`.
    #[must_use]
    pub fn protected_resource_metadata_url(&self) -> String {
        format!("{}{}", origin(&self.base_url), self.protected_resource_metadata_path())
    }

    #[must_use]
    pub fn authorization_server_metadata(&self) -> AuthorizationServerMetadata {
        let endpoint = |name: &str| format!("{}/{name}", self.base_url);
        AuthorizationServerMetadata {
            issuer: self.base_url.clone(),
            authorization_endpoint: endpoint("authorize"),
            token_endpoint: endpoint("token"),
            registration_endpoint: endpoint("register"),
            revocation_endpoint: endpoint("revoke"),
            scopes_supported: self.scopes.clone(),
            response_types_supported: vec!["code"],
            grant_types_supported: vec!["authorization_code", "refresh_token"],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic",
                "client_secret_post",
                "none",
            ],
            revocation_endpoint_auth_methods_supported: vec![
                "client_secret_basic",
                "client_secret_post",
                "none",
            ],
            code_challenge_methods_supported: vec!["S256", "plain"],
        }
    }

    #[must_use]
    pub fn protected_resource_metadata(&self) -> ProtectedResourceMetadata {
        ProtectedResourceMetadata {
            resource: self.resource_url.clone(),
            authorization_servers: vec![self.issuer_url.clone()],
            scopes_supported: self.scopes.clone(),
            bearer_methods_supported: vec!["header"],
        }
    }

    /// Both discovery routes, to be merged at the host root behind a permissive
    /// CORS layer.
    pub fn routes<S>(self: Arc<Self>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        Router::new()
            .route(&self.authorization_server_metadata_path(), get(handle_authorization_server))
            .route(&self.protected_resource_metadata_path(), get(handle_protected_resource))
            .with_state(self)
    }
}

// ─── Handlers ───

async fn handle_authorization_server(
    State(router): State<Arc<WellKnownRouter>>,
) -> impl IntoResponse {
    Json(router.authorization_server_metadata())
}

async fn handle_protected_resource(
    State(router): State<Arc<WellKnownRouter>>,
) -> impl IntoResponse {
    Json(router.protected_resource_metadata())
}

fn url_path(url: &str) -> String {
    Url::parse(url).map(|u| u.path().trim_end_matches('/').to_string()).unwrap_or_default()
}

fn origin(url: &str) -> String {
    Url::parse(url).map(|u| u.origin().ascii_serialization()).unwrap_or_else(|_| url.to_string())
}
