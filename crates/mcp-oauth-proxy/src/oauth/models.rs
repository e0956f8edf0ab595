//! Records the proxy keeps between requests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authorization request waiting for consent and the upstream callback.
#[derive(Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: String,
    pub client_id: String,
    /// Captured at authorize time so the consent page needs no registry lookup.
    pub client_name: Option<String>,
    pub client_redirect_uri: String,
    pub client_state: Option<String>,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Verifier for the proxy↔upstream PKCE pair.
    pub proxy_code_verifier: Option<String>,
    pub resource: Option<String>,
    /// Set when the consent page is rendered.
    pub csrf_token: Option<String>,
    pub csrf_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("client_id", &self.client_id)
            .field("client_redirect_uri", &self.client_redirect_uri)
            .field("scopes", &self.scopes)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Token response from the upstream token endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Non-standard, sent by some providers (Keycloak, Azure AD).
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for UpstreamTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTokens")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// A proxy-issued authorization code carrying the upstream bundle until the
/// client redeems it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub idp_tokens: UpstreamTokens,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Upstream tokens retained server-side, referenced from proxy refresh tokens.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamTokenSet {
    pub upstream_token_id: String,
    pub client_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UpstreamTokenSet {
    /// Build a retained set from a fresh upstream response.
    #[must_use]
    pub fn from_response(
        upstream_token_id: String,
        client_id: String,
        tokens: &UpstreamTokens,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upstream_token_id,
            client_id,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            access_expires_at: tokens.expires_in.map(|secs| now + seconds(secs)),
            refresh_expires_at: tokens.refresh_expires_in.map(|secs| now + seconds(secs)),
            token_type: tokens.token_type.clone(),
            scope: tokens.scope.clone(),
            created_at: now,
        }
    }

    /// Fold an upstream refresh response into this set. Providers that do not
    /// rotate refresh tokens omit them, so the previous one is kept.
    pub fn apply_refresh(&mut self, tokens: &UpstreamTokens, now: DateTime<Utc>) {
        self.access_token.clone_from(&tokens.access_token);
        self.access_expires_at = tokens.expires_in.map(|secs| now + seconds(secs));
        if let Some(refresh) = &tokens.refresh_token {
            self.refresh_token = Some(refresh.clone());
            self.refresh_expires_at = tokens.refresh_expires_in.map(|secs| now + seconds(secs));
        }
        self.token_type.clone_from(&tokens.token_type);
        if tokens.scope.is_some() {
            self.scope.clone_from(&tokens.scope);
        }
    }

    /// True if the access token expires within `skew` of `now`. Tokens without
    /// a known expiry are never stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.access_expires_at.is_some_and(|at| at <= now + chrono_duration(skew))
    }
}

impl std::fmt::Debug for UpstreamTokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTokenSet")
            .field("upstream_token_id", &self.upstream_token_id)
            .field("client_id", &self.client_id)
            .field("access_expires_at", &self.access_expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Server-side state backing a live proxy refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub upstream_token_id: String,
    pub jti: String,
    pub resource: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A dynamically registered client (RFC 7591).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    /// SHA-256 hex of the secret; `None` for public clients.
    pub client_secret_hash: Option<String>,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub created_at: DateTime<Utc>,
}

impl RegisteredClient {
    /// Public clients authenticate with PKCE alone.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.client_secret_hash.is_none()
    }
}

/// Upper bound for lifetimes reported by upstreams (100 years).
const MAX_LIFETIME_SECS: i64 = 100 * 365 * 24 * 60 * 60;

pub(crate) fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_LIFETIME_SECS))
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    seconds(duration.as_secs())
}
