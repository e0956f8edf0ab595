//! MCP OAuth Proxy
//!
//! An OAuth 2.0 authorization-code proxy that lets MCP clients authenticate
//! against an identity provider that does not support dynamic client
//! registration. Clients register with the proxy; the proxy holds a single
//! upstream registration and issues its own tokens.
//!
//! # Features
//!
//! - **Consent screen**: per client + redirect URI, remembered in signed cookies
//! - **Two PKCE legs**: client↔proxy and proxy↔upstream, never mixed
//! - **Token translation**: upstream tokens stay server-side; clients get proxy JWTs
//! - **Path-aware discovery**: RFC 8414 / RFC 9728 metadata for sub-path deployments
//! - **SSRF guard**: pinned-IP, size-capped outbound fetches
//!
//! # Example
//!
//! ```no_run
//! use mcp_oauth_proxy::{OAuthProxy, ProxyConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::from_env()?;
//!     let mcp_path = format!("{}{}", config.base_path(), config.mcp_path);
//!     let mcp = server::transport::identity_routes(&mcp_path);
//!     let proxy = OAuthProxy::new(config)?;
//!
//!     server::run_http(proxy, mcp, 8000).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod oauth;
pub mod server;
pub mod ssrf;
pub mod store;

pub use config::ProxyConfig;
pub use error::{OAuthError, SsrfError, SsrfFetchError};
pub use oauth::OAuthProxy;
pub use ssrf::{SsrfGuard, SsrfPolicy};
