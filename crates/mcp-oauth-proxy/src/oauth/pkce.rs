//! PKCE (Proof Key for Code Exchange).
//!
//! Two independent PKCE pairs exist per flow. The client's pair is verified
//! at the proxy token endpoint (S256 or plain, RFC 7636). The proxy's own pair
//! protects the upstream exchange: [`PkceBridge`] mints a verifier at
//! authorize time and only its S256 challenge ever reaches the upstream.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// `S256` challenge method.
pub const S256: &str = "S256";

/// `plain` challenge method.
pub const PLAIN: &str = "plain";

/// Generate a 64-character verifier from the unreserved character set.
#[must_use]
pub fn generate_verifier() -> String {
    super::random_token()
}

/// Compute `BASE64URL(SHA256(code_verifier))`.
#[must_use]
pub fn s256_challenge(code_verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

/// Verify a PKCE S256 code challenge.
pub fn verify_s256(code_verifier: &str, code_challenge: &str) -> bool {
    constant_time_eq(&s256_challenge(code_verifier), code_challenge)
}

/// Verify `code_verifier` against a stored challenge. A missing method means
/// `plain` (RFC 7636 §4.3).
pub fn verify(method: Option<&str>, code_verifier: &str, code_challenge: &str) -> bool {
    match method.unwrap_or(PLAIN) {
        S256 => verify_s256(code_verifier, code_challenge),
        PLAIN => constant_time_eq(code_verifier, code_challenge),
        _ => false,
    }
}

/// Whether the proxy accepts `method` from clients.
#[must_use]
pub fn is_supported_method(method: &str) -> bool {
    matches!(method, S256 | PLAIN)
}

/// RFC 7636 §4.1: 43-128 characters from `[A-Za-z0-9-._~]`.
#[must_use]
pub fn is_valid_verifier(code_verifier: &str) -> bool {
    (43..=128).contains(&code_verifier.len())
        && code_verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Proxy-side PKCE for the upstream leg.
#[derive(Debug, Clone, Copy)]
pub struct PkceBridge {
    enabled: bool,
}

impl PkceBridge {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Verifier to store on a new transaction, if forwarding is on.
    #[must_use]
    pub fn prepare(&self) -> Option<String> {
        self.enabled.then(generate_verifier)
    }

    /// `(code_challenge, code_challenge_method)` to send upstream.
    #[must_use]
    pub fn upstream_challenge(verifier: Option<&str>) -> Option<(String, &'static str)> {
        verifier.map(|v| (s256_challenge(v), S256))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 Appendix B test vector
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_s256_valid() {
        assert_eq!(s256_challenge(VERIFIER), CHALLENGE);
        assert!(verify_s256(VERIFIER, CHALLENGE));
    }

    #[test]
    fn test_s256_invalid_verifier() {
        assert!(!verify_s256("wrong-verifier", CHALLENGE));
        assert!(!verify(Some(S256), VERIFIER, "wrong-challenge"));
    }

    #[test]
    fn test_plain_and_default_method() {
        assert!(verify(Some(PLAIN), VERIFIER, VERIFIER));
        assert!(verify(None, VERIFIER, VERIFIER));
        assert!(!verify(None, VERIFIER, CHALLENGE));
        assert!(!verify(Some("S512"), VERIFIER, CHALLENGE));
    }

    #[test]
    fn test_generated_verifier_is_valid() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 64);
        assert!(is_valid_verifier(&verifier));
        assert!(!is_valid_verifier("short"));
        assert!(!is_valid_verifier(&"a/".repeat(30)));
    }

    #[test]
    fn test_bridge() {
        assert!(PkceBridge::new(false).prepare().is_none());

        let verifier = PkceBridge::new(true).prepare().unwrap();
        let (challenge, method) = PkceBridge::upstream_challenge(Some(&verifier)).unwrap();
        assert_eq!(method, "S256");
        assert!(verify_s256(&verifier, &challenge));
        assert!(PkceBridge::upstream_challenge(None).is_none());
    }
}
