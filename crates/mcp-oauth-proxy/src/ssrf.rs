//! SSRF-hardened outbound HTTP.
//!
//! Every request the proxy sends to a URL it does not fully control goes
//! through [`SsrfGuard`]:
//!
//! 1. The URL is validated ([`validate_url`]): HTTPS only, host required,
//!    optionally a non-root path.
//! 2. The host is resolved once and every candidate address must pass
//!    [`is_ip_allowed`].
//! 3. Each candidate is tried in order, connecting to the literal address.
//!    The host is never resolved again, so a DNS answer cannot change between
//!    the check and the connect.
//! 4. The body is capped: `Content-Length` is checked up front, and streamed
//!    bytes are counted so the read stops as soon as the cap is crossed.
//!
//! Redirects are never followed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HOST, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use url::{Host, Url};

use crate::error::{FetchResult, SsrfError, SsrfFetchError, TransportError};

/// Default response cap for [`SsrfGuard::ssrf_safe_fetch`]: 5 KB.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 5 * 1024;

/// Default per-attempt timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Address classification ──────────────────────────────────────────────────

/// Returns true if `ip` is a publicly routable destination.
///
/// Rejects loopback, link-local (including `169.254.169.254`), RFC 1918,
/// CGNAT `100.64.0.0/10`, unspecified, broadcast, multicast, reserved and
/// documentation ranges, IPv6 unique-local and link-local, and IPv4-mapped
/// IPv6 addresses wrapping any of those.
#[must_use]
pub fn is_ip_allowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_ipv4_allowed(v4),
        IpAddr::V6(v6) => is_ipv6_allowed(v6),
    }
}

fn is_ipv4_allowed(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let cgnat = a == 100 && (b & 0xc0) == 0x40;
    let this_network = a == 0;
    let reserved = a >= 240;

    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || cgnat
        || this_network
        || reserved)
}

fn is_ipv6_allowed(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_ipv4_allowed(v4);
    }

    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;

    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Knobs for the guard. [`SsrfPolicy::default`] is the strict production policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrfPolicy {
    /// Reject anything but `https://`.
    pub require_https: bool,
    /// Permit loopback targets (local development and tests only).
    pub allow_loopback: bool,
    /// Default response cap when a request does not set one.
    pub max_response_size: usize,
    /// Per-attempt timeout, also applied to the body read.
    pub request_timeout: Duration,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        Self {
            require_https: true,
            allow_loopback: false,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SsrfPolicy {
    /// Policy for talking to a local mock server over plain HTTP.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            require_https: false,
            allow_loopback: true,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Override the default response cap.
    #[must_use]
    pub const fn with_max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether `ip` may be connected to under this policy.
    #[must_use]
    pub fn permits(&self, ip: IpAddr) -> bool {
        is_ip_allowed(ip) || (self.allow_loopback && is_loopback(ip))
    }

    /// Validate URL shape under this policy.
    pub fn check_url(&self, url: &str, require_path: bool) -> Result<Url, SsrfError> {
        let parsed = Url::parse(url).map_err(|e| match e {
            url::ParseError::EmptyHost => SsrfError::MissingHost(url.to_string()),
            other => SsrfError::invalid_url(url, other.to_string()),
        })?;

        let scheme_ok =
            parsed.scheme() == "https" || (!self.require_https && parsed.scheme() == "http");
        if !scheme_ok {
            return Err(SsrfError::InsecureScheme(url.to_string()));
        }

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(SsrfError::MissingHost(url.to_string()));
        }

        if require_path && parsed.path().trim_end_matches('/').is_empty() {
            return Err(SsrfError::RootPath(url.to_string()));
        }

        Ok(parsed)
    }
}

/// Validate a URL under the strict policy.
///
/// Rejects non-HTTPS schemes and URLs without a host; with `require_path`,
/// also rejects a bare origin such as `https://example.com/`.
pub fn validate_url(url: &str, require_path: bool) -> Result<Url, SsrfError> {
    SsrfPolicy::default().check_url(url, require_path)
}

// ─── Collaborators ───────────────────────────────────────────────────────────

/// DNS resolution seam.
#[async_trait]
pub trait Resolver: Send + Sync + std::fmt::Debug {
    /// Resolve `host` to candidate addresses in preference order.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver via `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let mut ips = Vec::new();
        for addr in tokio::net::lookup_host((host, port)).await? {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// One connection attempt, pinned to a literal address.
#[derive(Debug, Clone)]
pub struct PinnedRequest {
    /// HTTP method.
    pub method: Method,
    /// URL as the caller wrote it (used for TLS server name).
    pub url: Url,
    /// Same URL with the host replaced by the pinned address.
    pub pinned_url: Url,
    /// Address to connect to.
    pub addr: SocketAddr,
    /// Request headers, `Host` included.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// Attempt timeout.
    pub timeout: Duration,
}

/// Streaming body of a transport response.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Raw response from a [`PinnedTransport`], body not yet read.
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
    /// Body chunks.
    pub body: BodyStream,
}

/// Sends a request to exactly the address in [`PinnedRequest::addr`].
#[async_trait]
pub trait PinnedTransport: Send + Sync + std::fmt::Debug {
    /// Perform one attempt.
    async fn send(&self, request: PinnedRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest` transport. Each attempt builds a client whose resolver override
/// maps the hostname to the pinned address, so TLS still validates against the
/// hostname while the socket goes to the vetted IP. Proxy environment
/// variables are ignored: a proxy would resolve the hostname itself.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self { user_agent: concat!("mcp-oauth-proxy/", env!("CARGO_PKG_VERSION")).to_string() }
    }
}

#[async_trait]
impl PinnedTransport for ReqwestTransport {
    async fn send(&self, request: PinnedRequest) -> Result<TransportResponse, TransportError> {
        let timeout = request.timeout;

        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(&self.user_agent);
        if let Some(domain) = request.url.domain() {
            builder = builder.resolve(domain, request.addr);
        }
        let client = builder.build().map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut call = client.request(request.method, request.url).headers(request.headers);
        if let Some(body) = request.body {
            call = call.body(body);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_length = response.content_length();
        let body = futures::stream::try_unfold(response, |mut response| async move {
            let chunk =
                response.chunk().await.map_err(|e| TransportError::Body(e.to_string()))?;
            Ok(chunk.map(|chunk| (chunk, response)))
        });

        Ok(TransportResponse { status, headers, content_length, body: Box::pin(body) })
    }
}

// ─── Requests and responses ──────────────────────────────────────────────────

/// Outbound request description handed to [`SsrfGuard::fetch`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: String,
    /// Extra headers. `Host` is always overwritten.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// Reject a bare origin.
    pub require_path: bool,
    /// Response cap; falls back to the policy default.
    pub max_size: Option<usize>,
}

impl OutboundRequest {
    /// A GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            require_path: false,
            max_size: None,
        }
    }

    /// A POST with an `application/x-www-form-urlencoded` body.
    #[must_use]
    pub fn post_form<'a>(
        url: impl Into<String>,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let body =
            url::form_urlencoded::Serializer::new(String::new()).extend_pairs(params).finish();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Some(Bytes::from(body)),
            require_path: false,
            max_size: None,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Require a non-root path.
    #[must_use]
    pub const fn require_path(mut self, require: bool) -> Self {
        self.require_path = require;
        self
    }

    /// Cap the response body.
    #[must_use]
    pub const fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }
}

/// Fully read, size-capped response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body bytes, never larger than the cap.
    pub body: Bytes,
}

impl FetchedResponse {
    /// Returns true for 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A validated URL with its vetted candidate addresses.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Parsed URL.
    pub url: Url,
    /// Host as written in the URL (IPv6 literals keep their brackets).
    pub host: String,
    /// Effective port.
    pub port: u16,
    /// Allowed addresses in connection order.
    pub candidates: Vec<IpAddr>,
}

impl ResolvedTarget {
    /// Value for the `Host` header: the original host, plus port when non-default.
    #[must_use]
    pub fn host_header(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// The URL rewritten to connect to `ip`; IPv6 literals are bracketed.
    #[must_use]
    pub fn pinned_url(&self, ip: IpAddr) -> Url {
        let mut url = self.url.clone();
        // Only cannot-be-a-base URLs reject an IP host, and those never validate.
        let _ = url.set_ip_host(ip);
        url
    }
}

// ─── Guard ───────────────────────────────────────────────────────────────────

/// SSRF-hardened fetcher. Cheap to clone.
#[derive(Clone)]
pub struct SsrfGuard {
    policy: SsrfPolicy,
    resolver: Arc<dyn Resolver>,
    transport: Arc<dyn PinnedTransport>,
}

impl SsrfGuard {
    /// Guard using the system resolver and `reqwest`.
    #[must_use]
    pub fn new(policy: SsrfPolicy) -> Self {
        Self::with_parts(policy, Arc::new(SystemResolver), Arc::new(ReqwestTransport::default()))
    }

    /// Guard with injected resolver and transport.
    #[must_use]
    pub fn with_parts(
        policy: SsrfPolicy,
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn PinnedTransport>,
    ) -> Self {
        Self { policy, resolver, transport }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &SsrfPolicy {
        &self.policy
    }

    /// Resolve the URL's host to candidate addresses, in resolver order.
    ///
    /// The lookup is bounded by the policy's request timeout.
    pub async fn resolve_hostname(&self, url: &Url) -> Result<Vec<IpAddr>, SsrfError> {
        let port = url.port_or_known_default().unwrap_or(443);
        match url.host() {
            Some(Host::Ipv4(ip)) => Ok(vec![IpAddr::V4(ip)]),
            Some(Host::Ipv6(ip)) => Ok(vec![IpAddr::V6(ip)]),
            Some(Host::Domain(domain)) => {
                let timeout = self.policy.request_timeout;
                let ips = tokio::time::timeout(timeout, self.resolver.resolve(domain, port))
                    .await
                    .map_err(|_| {
                        SsrfError::resolution_failed(domain, format!("timed out after {timeout:?}"))
                    })?
                    .map_err(|e| SsrfError::resolution_failed(domain, e.to_string()))?;
                if ips.is_empty() {
                    return Err(SsrfError::resolution_failed(domain, "no addresses returned"));
                }
                Ok(ips)
            }
            None => Err(SsrfError::MissingHost(url.to_string())),
        }
    }

    /// Validate `url` and resolve it. Every candidate must be permitted; one
    /// blocked address rejects the whole target.
    pub async fn validate_target(
        &self,
        url: &str,
        require_path: bool,
    ) -> Result<ResolvedTarget, SsrfError> {
        let parsed = self.policy.check_url(url, require_path)?;
        let candidates = self.resolve_hostname(&parsed).await?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        if let Some(ip) = candidates.iter().copied().find(|ip| !self.policy.permits(*ip)) {
            tracing::warn!(
                host = %host,
                ip = %ip,
                "Blocked outbound request to disallowed address"
            );
            return Err(SsrfError::BlockedIp { host, ip });
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        Ok(ResolvedTarget { url: parsed, host, port, candidates })
    }

    /// GET `url` and return at most `max_size` body bytes. Non-2xx is an error.
    pub async fn ssrf_safe_fetch(&self, url: &str, max_size: usize) -> FetchResult<Bytes> {
        let response = self.fetch(OutboundRequest::get(url).max_size(max_size)).await?;
        if !response.is_success() {
            let host = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
            return Err(SsrfFetchError::Status {
                host: host.unwrap_or_default(),
                status: response.status,
            });
        }
        Ok(response.body)
    }

    /// Send `request` through the guard, trying each candidate address in turn.
    ///
    /// Only connection failures and timeouts move on to the next candidate.
    /// Once a response starts, its outcome is final.
    pub async fn fetch(&self, request: OutboundRequest) -> FetchResult<FetchedResponse> {
        let target = self.validate_target(&request.url, request.require_path).await?;
        let max_size = request.max_size.unwrap_or(self.policy.max_response_size);
        let timeout = self.policy.request_timeout;

        let mut headers = request.headers;
        let host_header = HeaderValue::from_str(&target.host_header())
            .map_err(|e| SsrfError::invalid_url(target.url.as_str(), e.to_string()))?;
        headers.insert(HOST, host_header);

        let mut last_error = TransportError::Connect("no candidates".to_string());
        for (attempt, ip) in target.candidates.iter().copied().enumerate() {
            let pinned = PinnedRequest {
                method: request.method.clone(),
                url: target.url.clone(),
                pinned_url: target.pinned_url(ip),
                addr: SocketAddr::new(ip, target.port),
                headers: headers.clone(),
                body: request.body.clone(),
                timeout,
            };

            tracing::debug!(
                host = %target.host,
                target = %pinned.pinned_url,
                attempt,
                "Outbound request"
            );

            let outcome = tokio::time::timeout(timeout, self.transport.send(pinned)).await;
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    tracing::debug!(
                        host = %target.host,
                        ip = %ip,
                        error = %err,
                        "Candidate address failed"
                    );
                    last_error = err;
                    continue;
                }
                Err(_) => {
                    tracing::debug!(host = %target.host, ip = %ip, "Candidate address timed out");
                    last_error = TransportError::Timeout(timeout);
                    continue;
                }
            };

            return match tokio::time::timeout(timeout, read_capped(response, max_size)).await {
                Ok(result) => result,
                Err(_) => Err(SsrfFetchError::Timeout { host: target.host, timeout }),
            };
        }

        Err(SsrfFetchError::AllCandidatesFailed {
            host: target.host,
            attempts: target.candidates.len(),
            last_error,
        })
    }
}

impl Default for SsrfGuard {
    fn default() -> Self {
        Self::new(SsrfPolicy::default())
    }
}

impl std::fmt::Debug for SsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsrfGuard").field("policy", &self.policy).finish()
    }
}

async fn read_capped(response: TransportResponse, max_size: usize) -> FetchResult<FetchedResponse> {
    if response.content_length.is_some_and(|len| len > max_size as u64) {
        return Err(SsrfFetchError::TooLarge { limit: max_size });
    }

    let mut body = Vec::new();
    let mut stream = response.body;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(SsrfFetchError::Body)?;
        if body.len() + chunk.len() > max_size {
            return Err(SsrfFetchError::TooLarge { limit: max_size });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(FetchedResponse {
        status: response.status,
        headers: response.headers,
        body: Bytes::from(body),
    })
}
