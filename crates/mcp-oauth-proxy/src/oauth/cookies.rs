//! Signed consent cookies.
//!
//! Consent decisions live only in the browser: a JSON list of client keys,
//! signed with HMAC-SHA256 so the user agent cannot forge approvals. Wire
//! format is `base64url(json) "." base64url(mac)`.

use std::time::Duration;

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Clients the user approved.
pub const APPROVED_COOKIE: &str = "MCP_APPROVED_CLIENTS";

/// Clients the user denied.
pub const DENIED_COOKIE: &str = "MCP_DENIED_CLIENTS";

/// CSRF token for the consent form.
pub const CONSENT_STATE_COOKIE: &str = "MCP_CONSENT_STATE";

/// Derive a purpose-bound 32-byte key from a shared secret.
#[must_use]
pub fn derive_key(secret: &[u8], purpose: &str) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(purpose.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    key
}

/// Signs and verifies cookie payloads.
#[derive(Clone)]
pub struct CookieSigner {
    key: [u8; 32],
}

impl CookieSigner {
    #[must_use]
    pub const fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }

    /// `base64url(payload).base64url(hmac(base64url(payload)))`
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{encoded}.{tag}")
    }

    /// Return the payload if the signature checks out.
    #[must_use]
    pub fn verify(&self, value: &str) -> Option<Vec<u8>> {
        let (encoded, tag) = value.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&tag).ok()?;
        URL_SAFE_NO_PAD.decode(encoded).ok()
    }

    /// Sign a list of strings.
    #[must_use]
    pub fn encode_list(&self, items: &[String]) -> String {
        self.sign(serde_json::json!(items).to_string().as_bytes())
    }

    /// Verify and decode a signed list. Anything malformed is `None`.
    #[must_use]
    pub fn decode_list(&self, value: &str) -> Option<Vec<String>> {
        let payload = self.verify(value)?;
        serde_json::from_slice(&payload).ok()
    }
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

/// Canonical redirect URI for consent tracking: lower-case scheme and host,
/// non-default port kept, query and fragment dropped, trailing slash removed
/// unless the path is `/`.
#[must_use]
pub fn normalize_redirect_uri(uri: &str) -> String {
    let Ok(parsed) = Url::parse(uri.trim()) else {
        return uri.trim().to_string();
    };

    let mut normalized = format!("{}://", parsed.scheme());
    if let Some(host) = parsed.host_str() {
        normalized.push_str(&host.to_ascii_lowercase());
    }
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }

    let path = parsed.path();
    if path.len() > 1 {
        normalized.push_str(path.trim_end_matches('/'));
    } else {
        normalized.push_str(path);
    }
    normalized
}

/// Stable consent key for a client and redirect URI.
#[must_use]
pub fn client_key(client_id: &str, redirect_uri: &str) -> String {
    let material = format!("{client_id}:{}", normalize_redirect_uri(redirect_uri));
    URL_SAFE_NO_PAD.encode(Sha256::digest(material.as_bytes()))
}

/// `__Host-` prefix under HTTPS, `__` otherwise.
#[must_use]
pub fn cookie_name(base: &str, is_https: bool) -> String {
    if is_https { format!("__Host-{base}") } else { format!("__{base}") }
}

/// Format a `Set-Cookie` header value.
#[must_use]
pub fn set_cookie_header(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie =
        format!("{name}={value}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax", max_age.as_secs());
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract a named cookie value from request headers.
#[must_use]
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get_all(header::COOKIE).iter().filter_map(|v| v.to_str().ok()).find_map(|line| {
        line.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k.trim() == name).then(|| v.trim().to_string())
        })
    })
}

/// Read a consent cookie, preferring the prefixed name and falling back to the
/// development name.
#[must_use]
pub fn read_cookie(headers: &HeaderMap, base: &str, is_https: bool) -> Option<String> {
    extract_cookie(headers, &cookie_name(base, is_https))
        .or_else(|| extract_cookie(headers, &cookie_name(base, false)))
}
