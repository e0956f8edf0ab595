//! Proxy-issued tokens.
//!
//! Access and refresh tokens are HS256 JWTs signed with a key derived from the
//! proxy's signing secret, so access-token checks need no store lookup. The
//! refresh token additionally carries `utid`, the opaque id of the retained
//! upstream bundle. Upstream token values never appear in a proxy token.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::models::chrono_duration;
use crate::error::OAuthResult;

/// Distinguishes access from refresh tokens signed with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Refresh,
}

/// Claims carried by every proxy token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyClaims {
    pub iss: String,
    /// Client the token was issued to.
    pub sub: String,
    pub client_id: String,
    /// Space-delimited scopes.
    pub scope: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub token_use: TokenUse,
    /// Upstream token bundle id (refresh tokens only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utid: Option<String>,
    /// RFC 8707 resource indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl ProxyClaims {
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        super::split_scopes(Some(&self.scope))
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

/// A freshly signed token.
#[derive(Clone)]
pub struct MintedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// What a valid access token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub jti: String,
    pub resource: Option<String>,
}

impl From<ProxyClaims> for VerifiedToken {
    fn from(claims: ProxyClaims) -> Self {
        Self {
            scopes: claims.scopes(),
            expires_at: claims.expires_at(),
            client_id: claims.client_id,
            jti: claims.jti,
            resource: claims.resource,
        }
    }
}

/// Token issuance request.
#[derive(Debug, Clone, Copy)]
pub struct TokenParams<'a> {
    pub token_use: TokenUse,
    pub client_id: &'a str,
    pub scopes: &'a [String],
    pub ttl: Duration,
    pub upstream_token_id: Option<&'a str>,
    pub resource: Option<&'a str>,
}

/// Signs and verifies proxy tokens.
pub struct TokenIssuer {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(issuer: impl Into<String>, key: &[u8]) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            issuer,
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
        }
    }

    pub fn mint(&self, params: TokenParams<'_>) -> OAuthResult<MintedToken> {
        let now = Utc::now();
        let expires_at = now + chrono_duration(params.ttl);
        let jti = super::random_token();
        let claims = ProxyClaims {
            iss: self.issuer.clone(),
            sub: params.client_id.to_string(),
            client_id: params.client_id.to_string(),
            scope: params.scopes.join(" "),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: jti.clone(),
            token_use: params.token_use,
            utid: params.upstream_token_id.map(str::to_string),
            resource: params.resource.map(str::to_string),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(MintedToken { token, jti, expires_at })
    }

    /// Decode `token`, checking signature, issuer, expiry, and token use.
    #[must_use]
    pub fn verify(&self, token: &str, expected: TokenUse) -> Option<ProxyClaims> {
        match decode::<ProxyClaims>(token, &self.decoding, &self.validation) {
            Ok(data) if data.claims.token_use == expected => Some(data.claims),
            Ok(data) => {
                tracing::debug!(jti = %data.claims.jti, "Token presented with wrong token_use");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "Proxy token rejected");
                None
            }
        }
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").field("issuer", &self.issuer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("https://proxy.example.com", b"0123456789abcdef0123456789abcdef")
    }

    fn token_params(token_use: TokenUse, scopes: &[String], ttl: Duration) -> TokenParams<'_> {
        TokenParams {
            token_use,
            client_id: "client-1",
            scopes,
            ttl,
            upstream_token_id: None,
            resource: None,
        }
    }

    #[test]
    fn test_mint_verify_access() {
        let scopes = vec!["read".to_string(), "write".to_string()];
        let params = token_params(TokenUse::Access, &scopes, Duration::from_secs(3600));
        let minted = issuer().mint(params).unwrap();

        let claims = issuer().verify(&minted.token, TokenUse::Access).unwrap();
        assert_eq!(claims.sub, "client-1");
        assert_eq!(claims.jti, minted.jti);
        assert_eq!(claims.scopes(), scopes);
        assert!(claims.utid.is_none());

        let verified = VerifiedToken::from(claims);
        assert_eq!(verified.expires_at.timestamp(), minted.expires_at.timestamp());
    }

    #[test]
    fn test_token_use_enforced() {
        let params = token_params(TokenUse::Refresh, &[], Duration::from_secs(60));
        let minted = issuer().mint(params).unwrap();
        assert!(issuer().verify(&minted.token, TokenUse::Access).is_none());
        assert!(issuer().verify(&minted.token, TokenUse::Refresh).is_some());
    }

    #[test]
    fn test_wrong_key_or_issuer_rejected() {
        let params = token_params(TokenUse::Access, &[], Duration::from_secs(60));
        let minted = issuer().mint(params).unwrap();

        let other_key =
            TokenIssuer::new("https://proxy.example.com", b"another-key-another-key-another!");
        assert!(other_key.verify(&minted.token, TokenUse::Access).is_none());

        let other_issuer =
            TokenIssuer::new("https://evil.example.com", b"0123456789abcdef0123456789abcdef");
        assert!(other_issuer.verify(&minted.token, TokenUse::Access).is_none());

        assert!(issuer().verify("not-a-jwt", TokenUse::Access).is_none());
    }

    #[test]
    fn test_expired_rejected() {
        let minted = issuer().mint(token_params(TokenUse::Access, &[], Duration::ZERO)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(issuer().verify(&minted.token, TokenUse::Access).is_none());
    }

    #[test]
    fn test_refresh_carries_upstream_id_only() {
        let scopes = vec!["read".to_string()];
        let mut params = token_params(TokenUse::Refresh, &scopes, Duration::from_secs(60));
        params.upstream_token_id = Some("utid-123");
        let minted = issuer().mint(params).unwrap();

        let claims = issuer().verify(&minted.token, TokenUse::Refresh).unwrap();
        assert_eq!(claims.utid.as_deref(), Some("utid-123"));
    }
}
