//! OAuth 2.0 authorization-code proxy for MCP authentication.
//!
//! MCP clients register with the proxy and run a normal authorization-code
//! flow against it. The proxy runs its own flow against a fixed upstream
//! identity provider, keeps the upstream tokens server-side, and hands the
//! client proxy-signed JWTs instead.
//!
//! ## Supported Standards
//! - RFC 9728: OAuth Protected Resource Metadata
//! - RFC 8414: OAuth Authorization Server Metadata
//! - RFC 7591: Dynamic Client Registration
//! - RFC 7636: PKCE (S256 and plain from clients, S256 upstream)
//! - RFC 7009: Token Revocation
//! - RFC 6749: Authorization Code and Refresh Token Grants

pub mod clients;
pub mod consent;
pub mod cookies;
pub mod jwt;
pub mod models;
pub mod pkce;
pub mod proxy;
pub mod translator;
pub mod ui;
pub mod upstream;
pub mod well_known;

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::store::{KeyValueStore, MemoryStore};

pub use models::{ClientCode, RefreshTokenRecord, RegisteredClient, Transaction, UpstreamTokenSet};
pub use proxy::OAuthProxy;

/// Generate a random opaque token from two UUIDs (256 bits, 64 hex chars).
pub(crate) fn random_token() -> String {
    format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
}

/// SHA-256 hex digest, used as the storage key for bearer secrets.
pub(crate) fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Append query parameters to `uri`, using `&` when it already has a query.
pub(crate) fn append_query<'a>(
    uri: &str,
    params: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(params).finish();
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}{query}")
}

/// Split a space-delimited scope string.
pub(crate) fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope.map(|s| s.split_whitespace().map(str::to_string).collect()).unwrap_or_default()
}

/// Backing stores for all proxy state.
#[derive(Clone)]
pub struct ProxyStores {
    /// In-flight authorization transactions keyed by `txn_id`.
    pub transactions: Arc<dyn KeyValueStore<Transaction>>,
    /// Proxy authorization codes keyed by code.
    pub client_codes: Arc<dyn KeyValueStore<ClientCode>>,
    /// Refresh-token records keyed by SHA-256 hex of the token.
    pub refresh_tokens: Arc<dyn KeyValueStore<RefreshTokenRecord>>,
    /// Retained upstream token bundles keyed by `upstream_token_id`.
    pub upstream_tokens: Arc<dyn KeyValueStore<UpstreamTokenSet>>,
    /// Dynamically registered clients keyed by `client_id`.
    pub clients: Arc<dyn KeyValueStore<RegisteredClient>>,
}

impl ProxyStores {
    /// In-memory stores without background sweeping.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(MemoryStore::<Transaction>::new("transactions")),
            client_codes: Arc::new(MemoryStore::<ClientCode>::new("client_codes")),
            refresh_tokens: Arc::new(MemoryStore::<RefreshTokenRecord>::new("refresh_tokens")),
            upstream_tokens: Arc::new(MemoryStore::<UpstreamTokenSet>::new("upstream_tokens")),
            clients: Arc::new(MemoryStore::<RegisteredClient>::new("clients")),
        }
    }

    /// In-memory stores, each with a cleanup task sweeping every `every`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn in_memory_with_cleanup(every: Duration) -> Self {
        fn swept<V: Clone + Send + Sync + 'static>(
            name: &'static str,
            every: Duration,
        ) -> Arc<MemoryStore<V>> {
            let store = Arc::new(MemoryStore::new(name));
            Arc::clone(&store).start_cleanup_task(every);
            store
        }

        Self {
            transactions: swept::<Transaction>("transactions", every),
            client_codes: swept::<ClientCode>("client_codes", every),
            refresh_tokens: swept::<RefreshTokenRecord>("refresh_tokens", every),
            upstream_tokens: swept::<UpstreamTokenSet>("upstream_tokens", every),
            clients: swept::<RegisteredClient>("clients", every),
        }
    }
}

impl std::fmt::Debug for ProxyStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyStores").finish_non_exhaustive()
    }
}
