//! Error types for the OAuth proxy.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! [`OAuthError`] is what endpoint handlers see; the SSRF and store errors nest
//! inside it so `?` works across layers.

use std::net::IpAddr;
use std::time::Duration;

/// Pre-connect validation failures raised by the SSRF guard.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SsrfError {
    /// URL could not be parsed
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// Plain HTTP (or any other scheme) where HTTPS is required
    #[error("URL must use HTTPS: {0}")]
    InsecureScheme(String),

    /// URL without a host component
    #[error("URL must have a host: {0}")]
    MissingHost(String),

    /// Bare origin where a document path is required
    #[error("URL must have a non-root path: {0}")]
    RootPath(String),

    /// DNS lookup failed or returned nothing
    #[error("Failed to resolve {host}: {reason}")]
    ResolutionFailed {
        /// Hostname being resolved
        host: String,
        /// Resolver message
        reason: String,
    },

    /// Hostname resolved to an address outside the allow-list
    #[error("URL resolves to blocked IP address {ip} (host {host})")]
    BlockedIp {
        /// Hostname from the URL
        host: String,
        /// Address that was rejected
        ip: IpAddr,
    },
}

impl SsrfError {
    /// Create an invalid URL error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into(), reason: reason.into() }
    }

    /// Create a resolution error.
    #[must_use]
    pub fn resolution_failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResolutionFailed { host: host.into(), reason: reason.into() }
    }
}

/// Failures of a single pinned connection attempt.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP/TLS connect or request write failed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Attempt exceeded its timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Response body stream failed mid-read
    #[error("Body read failed: {0}")]
    Body(String),
}

/// Failures of a guarded fetch after validation passed (or validation itself).
#[derive(thiserror::Error, Debug)]
pub enum SsrfFetchError {
    /// Target rejected before any connection was made
    #[error(transparent)]
    Blocked(#[from] SsrfError),

    /// Response exceeded the size cap
    #[error("Response too large: exceeds {limit} bytes")]
    TooLarge {
        /// Configured cap in bytes
        limit: usize,
    },

    /// Every candidate address failed to connect
    #[error("All {attempts} candidate addresses for {host} failed: {last_error}")]
    AllCandidatesFailed {
        /// Hostname being fetched
        host: String,
        /// Number of addresses tried
        attempts: usize,
        /// Error from the final attempt
        last_error: TransportError,
    },

    /// Reading the body took longer than the request timeout
    #[error("Response body from {host} timed out after {timeout:?}")]
    Timeout {
        /// Hostname being fetched
        host: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Body stream broke after the response started
    #[error("Response body error: {0}")]
    Body(TransportError),

    /// Non-success status where the caller required 2xx
    #[error("Unexpected status {status} from {host}")]
    Status {
        /// Hostname being fetched
        host: String,
        /// HTTP status code
        status: u16,
    },
}

impl SsrfFetchError {
    /// Returns true if the failure happened before any connection was attempted.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Invalid proxy configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A URL setting failed to parse or has the wrong shape
    #[error("Invalid {field}: {reason}")]
    InvalidUrl {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// A required setting is empty
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

impl ConfigError {
    /// Create an invalid URL error.
    #[must_use]
    pub fn invalid_url(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl { field, reason: reason.into() }
    }
}

/// Errors from a key-value store backend.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Backend-specific failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// OAuth protocol errors surfaced by the proxy.
#[derive(thiserror::Error, Debug)]
pub enum OAuthError {
    /// Unknown client or failed client authentication
    #[error("Invalid client: {0}")]
    InvalidClient(String),

    /// Code or refresh token missing, expired, reused, or upstream-rejected
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Malformed or missing parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Requested scope exceeds what was granted
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Grant type the token endpoint does not handle
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Resource owner declined
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Dynamic client registration rejected (RFC 7591 §3.2.2)
    #[error("Invalid client metadata: {0}")]
    InvalidClientMetadata(String),

    /// Upstream token endpoint returned an error other than invalid_grant
    #[error("Upstream error ({status}): {error}")]
    Upstream {
        /// HTTP status from upstream
        status: u16,
        /// OAuth error code or body excerpt
        error: String,
    },

    /// Outbound target failed validation
    #[error("SSRF protection: {0}")]
    Ssrf(#[from] SsrfError),

    /// Outbound fetch failed
    #[error("Outbound fetch failed: {0}")]
    Fetch(SsrfFetchError),

    /// Store backend failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// JWT encode/decode failure not attributable to the client
    #[error("Token signing error: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl From<SsrfFetchError> for OAuthError {
    fn from(err: SsrfFetchError) -> Self {
        match err {
            SsrfFetchError::Blocked(inner) => Self::Ssrf(inner),
            other => Self::Fetch(other),
        }
    }
}

impl OAuthError {
    /// Create an invalid client error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient(message.into())
    }

    /// Create an invalid grant error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant(message.into())
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an invalid scope error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope(message.into())
    }

    /// Create an access denied error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    /// Create an invalid client metadata error.
    #[must_use]
    pub fn invalid_client_metadata(message: impl Into<String>) -> Self {
        Self::InvalidClientMetadata(message.into())
    }

    /// Create an upstream error.
    #[must_use]
    pub fn upstream(status: u16, error: impl Into<String>) -> Self {
        Self::Upstream { status, error: error.into() }
    }

    /// OAuth 2.0 `error` code for this error (RFC 6749 §5.2).
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::AccessDenied(_) => "access_denied",
            Self::InvalidClientMetadata(_) => "invalid_client_metadata",
            Self::Upstream { .. } | Self::Ssrf(_) | Self::Fetch(_) => "temporarily_unavailable",
            Self::Store(_) | Self::Signing(_) => "server_error",
        }
    }

    /// HTTP status for a token-endpoint JSON error response.
    ///
    /// `invalid_client` and `invalid_grant` map to 401 so MCP clients restart
    /// the authorization flow instead of retrying.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidClient(_) | Self::InvalidGrant(_) => 401,
            Self::InvalidRequest(_)
            | Self::InvalidScope(_)
            | Self::UnsupportedGrantType(_)
            | Self::InvalidClientMetadata(_) => 400,
            Self::AccessDenied(_) => 403,
            Self::Upstream { .. } | Self::Ssrf(_) | Self::Fetch(_) => 502,
            Self::Store(_) | Self::Signing(_) => 500,
        }
    }

    /// Human-readable `error_description`. Internal failures are not detailed.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::InvalidClient(m)
            | Self::InvalidGrant(m)
            | Self::InvalidRequest(m)
            | Self::InvalidScope(m)
            | Self::UnsupportedGrantType(m)
            | Self::AccessDenied(m)
            | Self::InvalidClientMetadata(m) => m.clone(),
            Self::Upstream { .. } | Self::Ssrf(_) | Self::Fetch(_) => {
                "Upstream authorization server unavailable".to_string()
            }
            Self::Store(_) | Self::Signing(_) => "Internal server error".to_string(),
        }
    }
}

/// Result type alias for OAuth operations.
pub type OAuthResult<T> = Result<T, OAuthError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for guarded fetches.
pub type FetchResult<T> = Result<T, SsrfFetchError>;
