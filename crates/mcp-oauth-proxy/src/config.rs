//! Configuration for the OAuth proxy.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::ConfigError;
use crate::ssrf::SsrfPolicy;

/// Default lifetimes and paths.
pub mod defaults {
    use std::time::Duration;

    /// In-flight authorization transaction (authorize → upstream callback).
    pub const TRANSACTION_TTL: Duration = Duration::from_secs(15 * 60);

    /// Proxy-issued authorization code.
    pub const CLIENT_CODE_TTL: Duration = Duration::from_secs(5 * 60);

    /// Proxy access token.
    pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

    /// Proxy access token when the upstream gave neither an expiry nor a refresh token.
    pub const ACCESS_TOKEN_TTL_NO_REFRESH: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Proxy refresh token.
    pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    /// Consent CSRF token and its cookie.
    pub const CSRF_TTL: Duration = Duration::from_secs(15 * 60);

    /// Approved/denied consent cookies.
    pub const CONSENT_COOKIE_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Upstream access tokens expiring within this window count as stale.
    pub const UPSTREAM_REFRESH_SKEW: Duration = Duration::from_secs(60);

    /// Timeout for upstream token endpoint calls.
    pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

    /// Cap on upstream token responses (ID tokens can be large).
    pub const UPSTREAM_MAX_RESPONSE_SIZE: usize = 64 * 1024;

    /// Path the upstream redirects back to.
    pub const REDIRECT_PATH: &str = "/auth/callback";

    /// Path of the protected MCP endpoint.
    pub const MCP_PATH: &str = "/mcp";

    /// Name shown on the consent page.
    pub const SERVER_NAME: &str = "MCP Server";
}

/// How the proxy authenticates to the upstream token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamAuthMethod {
    /// HTTP Basic with client id and secret.
    #[default]
    ClientSecretBasic,
    /// Client id and secret in the form body.
    ClientSecretPost,
}

impl std::str::FromStr for UpstreamAuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_secret_basic" => Ok(Self::ClientSecretBasic),
            "client_secret_post" => Ok(Self::ClientSecretPost),
            other => Err(format!("unsupported token endpoint auth method: {other}")),
        }
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream authorization endpoint (browser redirect target).
    pub upstream_authorization_endpoint: String,

    /// Upstream token endpoint (server-to-server, SSRF guarded).
    pub upstream_token_endpoint: String,

    /// Client id registered with the upstream.
    pub upstream_client_id: String,

    /// Client secret registered with the upstream.
    pub upstream_client_secret: SecretString,

    /// Upstream token endpoint authentication.
    pub upstream_auth_method: UpstreamAuthMethod,

    /// Public URL the proxy's endpoints are served under, without trailing slash.
    pub base_url: String,

    /// Root-level issuer used only for discovery addressing. Defaults to `base_url`.
    pub issuer_url: Option<String>,

    /// Path of the protected MCP endpoint relative to `base_url`.
    pub mcp_path: String,

    /// Callback path relative to `base_url` registered with the upstream.
    pub redirect_path: String,

    /// Key for signing proxy tokens and consent cookies.
    pub signing_key: SecretString,

    /// Run a separate PKCE exchange with the upstream.
    pub forward_pkce: bool,

    /// Ask the user before redirecting upstream.
    pub require_consent: bool,

    /// Name of the protected server, shown on the consent page.
    pub server_name: String,

    /// Scopes always requested upstream and used when a client asks for none.
    pub required_scopes: Vec<String>,

    /// Static parameters appended to the upstream authorize URL.
    pub extra_authorize_params: BTreeMap<String, String>,

    /// Static parameters added to upstream token requests.
    pub extra_token_params: BTreeMap<String, String>,

    /// Redirect URI patterns clients may register (`*` wildcards). `None` accepts
    /// only URIs the client registered.
    pub allowed_client_redirect_uris: Option<Vec<String>>,

    /// Transaction lifetime.
    pub transaction_ttl: Duration,

    /// Proxy authorization code lifetime.
    pub client_code_ttl: Duration,

    /// Proxy access token lifetime.
    pub access_token_ttl: Duration,

    /// Proxy refresh token lifetime.
    pub refresh_token_ttl: Duration,

    /// Access token lifetime when nothing better is known.
    pub fallback_access_token_ttl: Duration,

    /// Outbound request policy.
    pub ssrf_policy: SsrfPolicy,

    /// Cap on upstream token responses.
    pub upstream_max_response_size: usize,
}

impl ProxyConfig {
    /// Create a configuration with defaults for everything but the upstream
    /// registration and the public base URL.
    ///
    /// The signing key defaults to the upstream client secret; set
    /// [`ProxyConfig::signing_key`] to decouple them.
    #[must_use]
    pub fn new(
        upstream_authorization_endpoint: impl Into<String>,
        upstream_token_endpoint: impl Into<String>,
        upstream_client_id: impl Into<String>,
        upstream_client_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let secret: String = upstream_client_secret.into();
        Self {
            upstream_authorization_endpoint: upstream_authorization_endpoint.into(),
            upstream_token_endpoint: upstream_token_endpoint.into(),
            upstream_client_id: upstream_client_id.into(),
            upstream_client_secret: SecretString::new(secret.clone()),
            upstream_auth_method: UpstreamAuthMethod::default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            issuer_url: None,
            mcp_path: defaults::MCP_PATH.to_string(),
            redirect_path: defaults::REDIRECT_PATH.to_string(),
            signing_key: SecretString::new(secret),
            forward_pkce: true,
            require_consent: true,
            server_name: defaults::SERVER_NAME.to_string(),
            required_scopes: Vec::new(),
            extra_authorize_params: BTreeMap::new(),
            extra_token_params: BTreeMap::new(),
            allowed_client_redirect_uris: None,
            transaction_ttl: defaults::TRANSACTION_TTL,
            client_code_ttl: defaults::CLIENT_CODE_TTL,
            access_token_ttl: defaults::ACCESS_TOKEN_TTL,
            refresh_token_ttl: defaults::REFRESH_TOKEN_TTL,
            fallback_access_token_ttl: defaults::ACCESS_TOKEN_TTL_NO_REFRESH,
            ssrf_policy: SsrfPolicy::default().with_request_timeout(defaults::UPSTREAM_TIMEOUT),
            upstream_max_response_size: defaults::UPSTREAM_MAX_RESPONSE_SIZE,
        }
    }

    /// Create a test configuration whose upstream lives at `upstream_base`
    /// (typically a wiremock server on loopback).
    #[must_use]
    pub fn for_testing(upstream_base: &str) -> Self {
        let upstream_base = upstream_base.trim_end_matches('/');
        let mut config = Self::new(
            format!("{upstream_base}/authorize"),
            format!("{upstream_base}/token"),
            "upstream-client",
            "upstream-secret",
            "https://proxy.example.com",
        );
        config.signing_key = SecretString::new("test-signing-key".to_string());
        config.ssrf_policy = SsrfPolicy::for_testing();
        config
    }

    /// Create configuration from environment variables.
    ///
    /// Required: `MCP_PROXY_UPSTREAM_AUTHORIZATION_ENDPOINT`,
    /// `MCP_PROXY_UPSTREAM_TOKEN_ENDPOINT`, `MCP_PROXY_UPSTREAM_CLIENT_ID`,
    /// `MCP_PROXY_UPSTREAM_CLIENT_SECRET`, `MCP_PROXY_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns error if a required variable is missing or a value is invalid.
    pub fn from_env() -> anyhow::Result<Self> {
        fn required(name: &str) -> anyhow::Result<String> {
            std::env::var(name).with_context(|| format!("{name} must be set"))
        }
        fn optional(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }
        fn list(value: &str) -> Vec<String> {
            value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }

        let mut config = Self::new(
            required("MCP_PROXY_UPSTREAM_AUTHORIZATION_ENDPOINT")?,
            required("MCP_PROXY_UPSTREAM_TOKEN_ENDPOINT")?,
            required("MCP_PROXY_UPSTREAM_CLIENT_ID")?,
            required("MCP_PROXY_UPSTREAM_CLIENT_SECRET")?,
            required("MCP_PROXY_BASE_URL")?,
        );

        config.issuer_url = optional("MCP_PROXY_ISSUER_URL");
        if let Some(key) = optional("MCP_PROXY_SIGNING_KEY") {
            config.signing_key = SecretString::new(key);
        }
        if let Some(name) = optional("MCP_PROXY_SERVER_NAME") {
            config.server_name = name;
        }
        if let Some(path) = optional("MCP_PROXY_MCP_PATH") {
            config.mcp_path = path;
        }
        if let Some(path) = optional("MCP_PROXY_REDIRECT_PATH") {
            config.redirect_path = path;
        }
        if let Some(scopes) = optional("MCP_PROXY_REQUIRED_SCOPES") {
            config.required_scopes = list(&scopes);
        }
        if let Some(patterns) = optional("MCP_PROXY_ALLOWED_REDIRECT_URIS") {
            config.allowed_client_redirect_uris = Some(list(&patterns));
        }
        if let Some(flag) = optional("MCP_PROXY_FORWARD_PKCE") {
            config.forward_pkce =
                flag.parse().context("MCP_PROXY_FORWARD_PKCE must be true or false")?;
        }
        if let Some(flag) = optional("MCP_PROXY_REQUIRE_CONSENT") {
            config.require_consent =
                flag.parse().context("MCP_PROXY_REQUIRE_CONSENT must be true or false")?;
        }
        if let Some(method) = optional("MCP_PROXY_UPSTREAM_AUTH_METHOD") {
            config.upstream_auth_method = method.parse().map_err(anyhow::Error::msg)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check URLs and required values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_client_id.is_empty() {
            return Err(ConfigError::Missing("upstream_client_id"));
        }
        if self.signing_key.expose_secret().is_empty() {
            return Err(ConfigError::Missing("signing_key"));
        }

        let base = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid_url("base_url", e.to_string()))?;
        if base.host_str().is_none() {
            return Err(ConfigError::invalid_url("base_url", "must have a host"));
        }
        if let Some(issuer) = &self.issuer_url {
            Url::parse(issuer).map_err(|e| ConfigError::invalid_url("issuer_url", e.to_string()))?;
        }

        Url::parse(&self.upstream_authorization_endpoint).map_err(|e| {
            ConfigError::invalid_url("upstream_authorization_endpoint", e.to_string())
        })?;
        self.ssrf_policy
            .check_url(&self.upstream_token_endpoint, false)
            .map_err(|e| ConfigError::invalid_url("upstream_token_endpoint", e.to_string()))?;

        let paths = [("mcp_path", &self.mcp_path), ("redirect_path", &self.redirect_path)];
        for (field, path) in paths {
            if !path.starts_with('/') {
                return Err(ConfigError::invalid_url(field, "must start with '/'"));
            }
        }
        Ok(())
    }

    /// Whether cookies get the `Secure` flag and `__Host-` prefix.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.base_url.starts_with("https://")
    }

    /// Redirect URI registered with the upstream.
    #[must_use]
    pub fn upstream_redirect_uri(&self) -> String {
        format!("{}{}", self.base_url, self.redirect_path)
    }

    /// Issuer URL used for discovery addressing.
    #[must_use]
    pub fn issuer(&self) -> &str {
        self.issuer_url.as_deref().unwrap_or(&self.base_url)
    }

    /// Path component of `base_url` without trailing slash (`""` at root).
    #[must_use]
    pub fn base_path(&self) -> String {
        Url::parse(&self.base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }
}
