//! Dynamic client registration (RFC 7591) and redirect URI checks.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use url::Url;

use super::models::RegisteredClient;
use crate::error::{ConfigError, OAuthError, OAuthResult};
use crate::store::KeyValueStore;

const SUPPORTED_GRANT_TYPES: [&str; 2] = ["authorization_code", "refresh_token"];
const SUPPORTED_AUTH_METHODS: [&str; 3] = ["none", "client_secret_basic", "client_secret_post"];

/// `POST /register` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientRegistration {
    pub client_name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: Option<String>,
}

/// Registered clients plus the operator's redirect URI allow-list.
pub struct ClientRegistry {
    store: Arc<dyn KeyValueStore<RegisteredClient>>,
    allowed_patterns: Option<Vec<Regex>>,
}

impl ClientRegistry {
    /// `allowed_redirect_uris` entries are exact URIs or `*` wildcard globs.
    pub fn new(
        store: Arc<dyn KeyValueStore<RegisteredClient>>,
        allowed_redirect_uris: Option<&[String]>,
    ) -> Result<Self, ConfigError> {
        let allowed_patterns = allowed_redirect_uris
            .map(|patterns| {
                patterns.iter().map(|p| glob_to_regex(p)).collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        Ok(Self { store, allowed_patterns })
    }

    /// Register a client. Returns the record and, for confidential clients, the
    /// plaintext secret (shown once, stored only as a hash).
    pub async fn register(
        &self,
        request: ClientRegistration,
    ) -> OAuthResult<(RegisteredClient, Option<String>)> {
        let redirect_uris = request.redirect_uris.unwrap_or_default();
        if redirect_uris.is_empty() {
            return Err(OAuthError::invalid_client_metadata("redirect_uris is required"));
        }
        for uri in &redirect_uris {
            let parsed = Url::parse(uri).map_err(|e| {
                OAuthError::invalid_client_metadata(format!("invalid redirect_uri {uri}: {e}"))
            })?;
            if parsed.fragment().is_some() {
                return Err(OAuthError::invalid_client_metadata(
                    "redirect_uri must not contain a fragment",
                ));
            }
            if self.allowed_patterns.is_some() && !self.pattern_allows(uri) {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "redirect_uri not allowed: {uri}"
                )));
            }
        }

        let grant_types = if request.grant_types.is_empty() {
            SUPPORTED_GRANT_TYPES.iter().map(|g| (*g).to_string()).collect()
        } else {
            request.grant_types
        };
        if let Some(unsupported) =
            grant_types.iter().find(|g| !SUPPORTED_GRANT_TYPES.contains(&g.as_str()))
        {
            return Err(OAuthError::invalid_client_metadata(format!(
                "unsupported grant_type: {unsupported}"
            )));
        }

        let response_types = if request.response_types.is_empty() {
            vec!["code".to_string()]
        } else {
            request.response_types
        };
        if response_types.iter().any(|r| r != "code") {
            return Err(OAuthError::invalid_client_metadata(
                "only response_type 'code' is supported",
            ));
        }

        let auth_method =
            request.token_endpoint_auth_method.unwrap_or_else(|| "client_secret_basic".to_string());
        if !SUPPORTED_AUTH_METHODS.contains(&auth_method.as_str()) {
            return Err(OAuthError::invalid_client_metadata(format!(
                "unsupported token_endpoint_auth_method: {auth_method}"
            )));
        }

        let client_secret = (auth_method != "none").then(super::random_token);
        let client = RegisteredClient {
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            client_secret_hash: client_secret.as_deref().map(super::hash_token),
            client_name: request.client_name,
            redirect_uris,
            grant_types,
            response_types,
            token_endpoint_auth_method: auth_method,
            created_at: Utc::now(),
        };
        self.store.put(&client.client_id, client.clone(), None).await?;

        tracing::info!(
            client_id = %client.client_id,
            auth_method = %client.token_endpoint_auth_method,
            "Registered OAuth client"
        );
        Ok((client, client_secret))
    }

    /// Look up a client by id.
    pub async fn get(&self, client_id: &str) -> OAuthResult<Option<RegisteredClient>> {
        Ok(self.store.get(client_id).await?)
    }

    /// Authenticate a client at the token or revocation endpoint.
    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> OAuthResult<RegisteredClient> {
        let client = self
            .get(client_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

        if let Some(expected) = &client.client_secret_hash {
            let presented = client_secret.map(super::hash_token).unwrap_or_default();
            if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
                tracing::warn!(client_id = %client_id, "Client authentication failed");
                return Err(OAuthError::invalid_client("Invalid client credentials"));
            }
        }
        Ok(client)
    }

    /// Pick the redirect URI for an authorization request.
    ///
    /// Accepts a registered URI (loopback URIs match on any port, RFC 8252
    /// §7.3) or one matched by the operator's patterns. When the request omits
    /// the URI, the client's only registered URI is used.
    pub fn resolve_redirect_uri(
        &self,
        client: &RegisteredClient,
        requested: Option<&str>,
    ) -> OAuthResult<String> {
        let Some(requested) = requested else {
            return match client.redirect_uris.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(OAuthError::invalid_request("redirect_uri is required")),
            };
        };

        let registered = client
            .redirect_uris
            .iter()
            .any(|uri| uri == requested || loopback_port_agnostic_match(uri, requested));
        if registered || self.pattern_allows(requested) {
            return Ok(requested.to_string());
        }

        tracing::warn!(
            client_id = %client.client_id,
            redirect_uri = %requested,
            "Rejected redirect_uri"
        );
        Err(OAuthError::invalid_request("redirect_uri not registered for this client"))
    }

    fn pattern_allows(&self, uri: &str) -> bool {
        self.allowed_patterns
            .as_ref()
            .is_some_and(|patterns| patterns.iter().any(|p| p.is_match(uri)))
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("allowed_patterns", &self.allowed_patterns.as_ref().map(Vec::len))
            .finish()
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, ConfigError> {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| ConfigError::invalid_url("allowed_client_redirect_uris", e.to_string()))
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn loopback_port_agnostic_match(registered: &str, requested: &str) -> bool {
    let (Ok(registered), Ok(requested)) = (Url::parse(registered), Url::parse(requested)) else {
        return false;
    };
    registered.scheme() == "http"
        && requested.scheme() == "http"
        && is_loopback_host(&registered)
        && registered.host() == requested.host()
        && registered.path() == requested.path()
        && registered.query() == requested.query()
}
