//! Translation between upstream tokens and proxy-issued tokens.
//!
//! The upstream bundle never leaves the process: it rides on the
//! [`ClientCode`] until redemption, then sits in the upstream token store under
//! an opaque id that the proxy refresh token references.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::cookies::derive_key;
use super::jwt::{TokenIssuer, TokenParams, TokenUse, VerifiedToken};
use super::models::{
    ClientCode, RefreshTokenRecord, RegisteredClient, Transaction, UpstreamTokenSet,
    chrono_duration,
};
use super::pkce::{self, PkceBridge};
use super::upstream::UpstreamTokenClient;
use super::{ProxyStores, append_query, hash_token, random_token};
use crate::config::{ProxyConfig, defaults};
use crate::error::{OAuthError, OAuthResult};

/// Query parameters on the upstream redirect back to the proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Successful token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Exchanges codes and refresh tokens, talking to the upstream as needed.
pub struct TokenTranslator {
    config: Arc<ProxyConfig>,
    stores: ProxyStores,
    issuer: TokenIssuer,
    upstream: Arc<dyn UpstreamTokenClient>,
}

impl TokenTranslator {
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        stores: ProxyStores,
        upstream: Arc<dyn UpstreamTokenClient>,
    ) -> Self {
        let key = derive_key(config.signing_key.expose_secret().as_bytes(), "proxy-jwt");
        let issuer = TokenIssuer::new(config.base_url.clone(), &key);
        Self { config, stores, issuer, upstream }
    }

    /// URL that starts the upstream leg for `txn`.
    #[must_use]
    pub fn upstream_authorize_url(&self, txn: &Transaction) -> String {
        let mut scopes = txn.scopes.clone();
        for scope in &self.config.required_scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        let scope = scopes.join(" ");
        let redirect_uri = self.config.upstream_redirect_uri();
        let challenge = PkceBridge::upstream_challenge(txn.proxy_code_verifier.as_deref());

        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.upstream_client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("state", txn.txn_id.as_str()),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        if let Some((challenge, method)) = &challenge {
            params.push(("code_challenge", challenge.as_str()));
            params.push(("code_challenge_method", *method));
        }
        if let Some(resource) = &txn.resource {
            params.push(("resource", resource.as_str()));
        }
        let extra = &self.config.extra_authorize_params;
        params.extend(extra.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        append_query(&self.config.upstream_authorization_endpoint, params)
    }

    /// Finish the upstream leg and return the client redirect URL.
    ///
    /// Fails only when the transaction is unknown; every later problem is
    /// reported to the client through its redirect URI.
    pub async fn complete_upstream_callback(&self, params: CallbackParams) -> OAuthResult<String> {
        let txn = match params.state.as_deref().filter(|s| !s.is_empty()) {
            Some(txn_id) => self.stores.transactions.take(txn_id).await?,
            None => None,
        }
        .ok_or_else(|| OAuthError::invalid_request("Invalid or expired transaction"))?;

        if let Some(error) = params.error.as_deref() {
            tracing::warn!(client_id = %txn.client_id, error, "Upstream authorization failed");
            return Ok(client_redirect(&txn, error, params.error_description.as_deref()));
        }
        let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(client_redirect(&txn, "invalid_request", Some("Missing authorization code")));
        };

        let redirect_uri = self.config.upstream_redirect_uri();
        let verifier = txn.proxy_code_verifier.as_deref();
        let tokens = match self.upstream.exchange_code(code, &redirect_uri, verifier).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(
                    client_id = %txn.client_id,
                    error = %e,
                    "Upstream code exchange failed"
                );
                let error = match e {
                    OAuthError::Upstream { .. } | OAuthError::Ssrf(_) | OAuthError::Fetch(_) => {
                        "temporarily_unavailable"
                    }
                    _ => "server_error",
                };
                return Ok(client_redirect(&txn, error, Some("Upstream token exchange failed")));
            }
        };

        let now = Utc::now();
        let client_code = ClientCode {
            code: random_token(),
            client_id: txn.client_id.clone(),
            redirect_uri: txn.client_redirect_uri.clone(),
            code_challenge: txn.code_challenge.clone(),
            code_challenge_method: txn.code_challenge_method.clone(),
            scopes: txn.scopes.clone(),
            resource: txn.resource.clone(),
            idp_tokens: tokens,
            expires_at: now + chrono_duration(self.config.client_code_ttl),
            created_at: now,
        };
        self.stores
            .client_codes
            .put(&client_code.code, client_code.clone(), Some(self.config.client_code_ttl))
            .await?;
        tracing::info!(client_id = %txn.client_id, "Issued authorization code");

        let mut query = vec![("code", client_code.code.as_str())];
        if let Some(state) = &txn.client_state {
            query.push(("state", state.as_str()));
        }
        Ok(append_query(&txn.client_redirect_uri, query))
    }

    /// `grant_type=authorization_code`
    pub async fn exchange_authorization_code(
        &self,
        client: &RegisteredClient,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> OAuthResult<TokenResponse> {
        let stored = self
            .stores
            .client_codes
            .take(code)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("Invalid or expired authorization code"))?;

        let now = Utc::now();
        if stored.client_id != client.client_id {
            tracing::warn!(
                client_id = %client.client_id,
                "Authorization code presented by another client"
            );
            return Err(OAuthError::invalid_grant(
                "Authorization code was not issued to this client",
            ));
        }
        if stored.expires_at <= now {
            return Err(OAuthError::invalid_grant("Authorization code expired"));
        }
        if redirect_uri.is_some_and(|uri| uri != stored.redirect_uri) {
            return Err(OAuthError::invalid_grant("redirect_uri does not match"));
        }
        if let Some(challenge) = &stored.code_challenge {
            let verifier = code_verifier
                .ok_or_else(|| OAuthError::invalid_grant("code_verifier is required"))?;
            if !pkce::verify(stored.code_challenge_method.as_deref(), verifier, challenge) {
                tracing::warn!(client_id = %client.client_id, "PKCE verification failed");
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
        }

        let upstream = UpstreamTokenSet::from_response(
            random_token(),
            client.client_id.clone(),
            &stored.idp_tokens,
            now,
        );
        let scopes = GrantedScopes {
            access: &stored.scopes,
            granted: &stored.scopes,
        };
        self.issue(&client.client_id, scopes, stored.resource.as_deref(), &upstream, now)
            .await
    }

    /// `grant_type=refresh_token`, rotating the refresh token.
    pub async fn exchange_refresh_token(
        &self,
        client: &RegisteredClient,
        refresh_token: &str,
        scopes: &[String],
    ) -> OAuthResult<TokenResponse> {
        let invalid = || OAuthError::invalid_grant("Invalid or expired refresh token");
        let claims = self.issuer.verify(refresh_token, TokenUse::Refresh).ok_or_else(invalid)?;
        let token_hash = hash_token(refresh_token);
        let record = self.stores.refresh_tokens.get(&token_hash).await?.ok_or_else(invalid)?;

        if record.client_id != client.client_id || claims.client_id != client.client_id {
            tracing::warn!(
                client_id = %client.client_id,
                "Refresh token presented by another client"
            );
            return Err(OAuthError::invalid_grant("Refresh token was not issued to this client"));
        }
        if claims.utid.as_deref() != Some(record.upstream_token_id.as_str()) {
            return Err(invalid());
        }

        let access_scopes = if scopes.is_empty() { record.scopes.clone() } else { scopes.to_vec() };
        if let Some(extra) = access_scopes.iter().find(|s| !record.scopes.contains(s)) {
            return Err(OAuthError::invalid_scope(format!("Scope not granted: {extra}")));
        }

        let mut upstream = self
            .stores
            .upstream_tokens
            .get(&record.upstream_token_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("Upstream session not found"))?;

        let now = Utc::now();
        if upstream.is_stale(now, defaults::UPSTREAM_REFRESH_SKEW) {
            let Some(upstream_refresh) = upstream.refresh_token.clone() else {
                return Err(OAuthError::invalid_grant("Upstream session expired"));
            };
            tracing::debug!(
                upstream_token_id = %upstream.upstream_token_id,
                "Refreshing upstream tokens"
            );
            let tokens = self.upstream.refresh(&upstream_refresh, &record.scopes).await?;
            upstream.apply_refresh(&tokens, now);
        }

        // A concurrent refresh with the same token loses here.
        if self.stores.refresh_tokens.take(&token_hash).await?.is_none() {
            return Err(invalid());
        }
        // The rotated refresh token keeps the full grant; only the access token narrows.
        let scopes = GrantedScopes {
            access: &access_scopes,
            granted: &record.scopes,
        };
        self.issue(&client.client_id, scopes, record.resource.as_deref(), &upstream, now)
            .await
    }

    /// RFC 7009 revocation. Unknown tokens and tokens of other clients are
    /// ignored. Access tokens are stateless and simply run out.
    pub async fn revoke(&self, client: &RegisteredClient, token: &str) -> OAuthResult<()> {
        let token_hash = hash_token(token);
        let Some(record) = self.stores.refresh_tokens.get(&token_hash).await? else {
            return Ok(());
        };
        if record.client_id != client.client_id {
            tracing::warn!(
                client_id = %client.client_id,
                "Revocation of another client's token ignored"
            );
            return Ok(());
        }

        self.stores.refresh_tokens.delete(&token_hash).await?;
        self.stores.upstream_tokens.delete(&record.upstream_token_id).await?;
        tracing::info!(client_id = %client.client_id, jti = %record.jti, "Revoked refresh token");
        Ok(())
    }

    /// Map a proxy access token to what it grants.
    #[must_use]
    pub fn verify_access_token(&self, token: &str) -> Option<VerifiedToken> {
        self.issuer.verify(token, TokenUse::Access).map(VerifiedToken::from)
    }

    async fn issue(
        &self,
        client_id: &str,
        scopes: GrantedScopes<'_>,
        resource: Option<&str>,
        upstream: &UpstreamTokenSet,
        now: DateTime<Utc>,
    ) -> OAuthResult<TokenResponse> {
        let (access_ttl, refresh_ttl) = self.lifetimes(upstream, now);

        self.stores
            .upstream_tokens
            .put(&upstream.upstream_token_id, upstream.clone(), Some(refresh_ttl))
            .await?;

        let access = self.issuer.mint(TokenParams {
            token_use: TokenUse::Access,
            client_id,
            scopes: scopes.access,
            ttl: access_ttl,
            upstream_token_id: None,
            resource,
        })?;
        let refresh = self.issuer.mint(TokenParams {
            token_use: TokenUse::Refresh,
            client_id,
            scopes: scopes.granted,
            ttl: refresh_ttl,
            upstream_token_id: Some(&upstream.upstream_token_id),
            resource,
        })?;

        let record = RefreshTokenRecord {
            client_id: client_id.to_string(),
            scopes: scopes.granted.to_vec(),
            upstream_token_id: upstream.upstream_token_id.clone(),
            jti: refresh.jti.clone(),
            resource: resource.map(str::to_string),
            expires_at: refresh.expires_at,
            created_at: now,
        };
        let refresh_hash = hash_token(&refresh.token);
        self.stores.refresh_tokens.put(&refresh_hash, record, Some(refresh_ttl)).await?;

        tracing::info!(
            client_id = %client_id,
            access_jti = %access.jti,
            expires_in = access_ttl.as_secs(),
            "Issued proxy tokens"
        );
        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".to_string(),
            expires_in: access_ttl.as_secs(),
            refresh_token: Some(refresh.token),
            scope: (!scopes.access.is_empty()).then(|| scopes.access.join(" ")),
        })
    }

    /// Access lifetime is capped by the upstream access expiry. Without an
    /// expiry or an upstream refresh token nothing can renew the session, so
    /// the long fallback applies. Refresh never outlives the upstream refresh
    /// token but always covers the access token.
    fn lifetimes(&self, upstream: &UpstreamTokenSet, now: DateTime<Utc>) -> (Duration, Duration) {
        let remaining = |at: DateTime<Utc>| (at - now).to_std().unwrap_or(Duration::ZERO);

        let access_ttl = match upstream.access_expires_at {
            Some(at) => self.config.access_token_ttl.min(remaining(at)),
            None if upstream.refresh_token.is_some() => self.config.access_token_ttl,
            None => self.config.fallback_access_token_ttl,
        };
        let refresh_ttl =
            upstream.refresh_expires_at.map_or(self.config.refresh_token_ttl, remaining);
        (access_ttl, refresh_ttl.max(access_ttl))
    }
}

impl std::fmt::Debug for TokenTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTranslator").field("issuer", &self.issuer).finish_non_exhaustive()
    }
}

/// Scopes carried by an issued token pair.
#[derive(Clone, Copy)]
struct GrantedScopes<'a> {
    /// Scopes on the access token and in the response.
    access: &'a [String],
    /// Scopes the refresh token may later be exchanged for.
    granted: &'a [String],
}

/// Redirect to the client with an OAuth error and the client's state.
fn client_redirect(txn: &Transaction, error: &str, description: Option<&str>) -> String {
    let mut query = vec![("error", error)];
    if let Some(description) = description {
        query.push(("error_description", description));
    }
    if let Some(state) = &txn.client_state {
        query.push(("state", state.as_str()));
    }
    append_query(&txn.client_redirect_uri, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::models::UpstreamTokens;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ─── Fake upstream ───

    #[derive(Default)]
    struct FakeUpstream {
        exchanges: AtomicUsize,
        refreshes: AtomicUsize,
        last_verifier: Mutex<Option<String>>,
        expires_in: Option<u64>,
        refresh_token: Option<&'static str>,
        fail_refresh: bool,
    }

    impl FakeUpstream {
        fn tokens(&self, n: usize) -> UpstreamTokens {
            UpstreamTokens {
                access_token: format!("upstream-at-{n}"),
                refresh_token: self.refresh_token.map(str::to_string),
                expires_in: self.expires_in,
                refresh_expires_in: None,
                token_type: "Bearer".into(),
                scope: None,
                id_token: None,
            }
        }
    }

    #[async_trait]
    impl UpstreamTokenClient for FakeUpstream {
        async fn exchange_code(
            &self,
            _code: &str,
            _redirect_uri: &str,
            code_verifier: Option<&str>,
        ) -> OAuthResult<UpstreamTokens> {
            *self.last_verifier.lock().unwrap() = code_verifier.map(str::to_string);
            Ok(self.tokens(self.exchanges.fetch_add(1, Ordering::SeqCst)))
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
            _scopes: &[String],
        ) -> OAuthResult<UpstreamTokens> {
            if self.fail_refresh {
                return Err(OAuthError::invalid_grant("upstream refresh token revoked"));
            }
            Ok(self.tokens(100 + self.refreshes.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn fresh_upstream() -> FakeUpstream {
        FakeUpstream {
            expires_in: Some(3600),
            refresh_token: Some("upstream-rt"),
            ..FakeUpstream::default()
        }
    }

    fn translator(upstream: Arc<FakeUpstream>) -> (TokenTranslator, ProxyStores) {
        let mut config = ProxyConfig::for_testing("https://idp.example.com");
        config.required_scopes = vec!["openid".into()];
        config.extra_authorize_params.insert("prompt".into(), "consent".into());
        let stores = ProxyStores::in_memory();
        (TokenTranslator::new(Arc::new(config), stores.clone(), upstream), stores)
    }

    fn client(id: &str) -> RegisteredClient {
        RegisteredClient {
            client_id: id.into(),
            client_secret_hash: None,
            client_name: None,
            redirect_uris: vec!["http://localhost:3000/cb".into()],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: "none".into(),
            created_at: Utc::now(),
        }
    }

    fn transaction(verifier: &str) -> Transaction {
        Transaction {
            txn_id: "txn-1".into(),
            client_id: "client-1".into(),
            client_name: None,
            client_redirect_uri: "http://localhost:3000/cb".into(),
            client_state: Some("xyz".into()),
            scopes: vec!["read".into(), "write".into()],
            code_challenge: Some(pkce::s256_challenge(verifier)),
            code_challenge_method: Some("S256".into()),
            proxy_code_verifier: Some("proxy-verifier".into()),
            resource: None,
            csrf_token: None,
            csrf_expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn query_param(url: &str, name: &str) -> Option<String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    const CLIENT_VERIFIER: &str = "client-verifier-client-verifier-client-verifier";

    async fn obtain_code(translator: &TokenTranslator, stores: &ProxyStores) -> String {
        let txn = transaction(CLIENT_VERIFIER);
        let txn_id = txn.txn_id.clone();
        stores.transactions.put(&txn_id, txn, None).await.unwrap();
        let redirect = translator
            .complete_upstream_callback(CallbackParams {
                code: Some("upstream-code".into()),
                state: Some("txn-1".into()),
                ..CallbackParams::default()
            })
            .await
            .unwrap();
        assert_eq!(query_param(&redirect, "state").as_deref(), Some("xyz"));
        query_param(&redirect, "code").unwrap()
    }

    // ─── Upstream authorize URL ───

    #[test]
    fn test_upstream_authorize_url() {
        let (translator, _) = translator(Arc::new(fresh_upstream()));
        let url = translator.upstream_authorize_url(&transaction(CLIENT_VERIFIER));

        assert!(url.starts_with("https://idp.example.com/authorize?response_type=code"));
        assert_eq!(query_param(&url, "client_id").as_deref(), Some("upstream-client"));
        assert_eq!(query_param(&url, "state").as_deref(), Some("txn-1"));
        assert_eq!(query_param(&url, "scope").as_deref(), Some("read write openid"));
        assert_eq!(
            query_param(&url, "redirect_uri").as_deref(),
            Some("https://proxy.example.com/auth/callback")
        );
        assert_eq!(
            query_param(&url, "code_challenge"),
            Some(pkce::s256_challenge("proxy-verifier"))
        );
        assert_eq!(query_param(&url, "code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(query_param(&url, "prompt").as_deref(), Some("consent"));
    }

    #[test]
    fn test_upstream_authorize_url_without_pkce_or_scopes() {
        let upstream = Arc::new(fresh_upstream());
        let mut config = ProxyConfig::for_testing("https://idp.example.com");
        config.upstream_authorization_endpoint =
            "https://idp.example.com/authorize?tenant=a".into();
        let translator = TokenTranslator::new(Arc::new(config), ProxyStores::in_memory(), upstream);

        let mut txn = transaction(CLIENT_VERIFIER);
        txn.proxy_code_verifier = None;
        txn.scopes.clear();
        txn.resource = Some("https://proxy.example.com/mcp".into());
        let url = translator.upstream_authorize_url(&txn);

        assert!(url.starts_with("https://idp.example.com/authorize?tenant=a&response_type=code"));
        assert!(query_param(&url, "scope").is_none());
        assert!(query_param(&url, "code_challenge").is_none());
        assert_eq!(query_param(&url, "resource").as_deref(), Some("https://proxy.example.com/mcp"));
    }

    // ─── Callback ───

    #[tokio::test]
    async fn test_callback_forwards_proxy_verifier() {
        let upstream = Arc::new(fresh_upstream());
        let (translator, stores) = translator(Arc::clone(&upstream));
        obtain_code(&translator, &stores).await;

        assert_eq!(upstream.last_verifier.lock().unwrap().as_deref(), Some("proxy-verifier"));
        assert!(stores.transactions.get("txn-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callback_unknown_transaction() {
        let (translator, _) = translator(Arc::new(fresh_upstream()));
        let err = translator
            .complete_upstream_callback(CallbackParams {
                code: Some("c".into()),
                state: Some("missing".into()),
                ..CallbackParams::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_callback_upstream_error_redirects_client() {
        let upstream = Arc::new(fresh_upstream());
        let (translator, stores) = translator(Arc::clone(&upstream));
        let txn = transaction(CLIENT_VERIFIER);
        let txn_id = txn.txn_id.clone();
        stores.transactions.put(&txn_id, txn, None).await.unwrap();

        let redirect = translator
            .complete_upstream_callback(CallbackParams {
                state: Some("txn-1".into()),
                error: Some("access_denied".into()),
                ..CallbackParams::default()
            })
            .await
            .unwrap();

        assert!(redirect.starts_with("http://localhost:3000/cb?"));
        assert_eq!(query_param(&redirect, "error").as_deref(), Some("access_denied"));
        assert_eq!(query_param(&redirect, "state").as_deref(), Some("xyz"));
        assert_eq!(upstream.exchanges.load(Ordering::SeqCst), 0);
    }

    // ─── Authorization code exchange ───

    #[tokio::test]
    async fn test_code_exchange_and_single_use() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));
        let code = obtain_code(&translator, &stores).await;
        let client = client("client-1");

        let response = translator
            .exchange_authorization_code(
                &client,
                &code,
                Some(CLIENT_VERIFIER),
                Some("http://localhost:3000/cb"),
            )
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 3600);
        assert_eq!(response.scope.as_deref(), Some("read write"));
        assert!(!response.access_token.contains("upstream-at"));

        let verified = translator.verify_access_token(&response.access_token).unwrap();
        assert_eq!(verified.client_id, "client-1");
        assert_eq!(verified.scopes, vec!["read", "write"]);

        let err = translator
            .exchange_authorization_code(&client, &code, Some(CLIENT_VERIFIER), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_code_exchange_rejects_wrong_client_and_verifier() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));

        let code = obtain_code(&translator, &stores).await;
        let err = translator
            .exchange_authorization_code(&client("other"), &code, Some(CLIENT_VERIFIER), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));

        let code = obtain_code(&translator, &stores).await;
        let err = translator
            .exchange_authorization_code(&client("client-1"), &code, Some("wrong-verifier"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(ref m) if m.contains("PKCE")));

        let code = obtain_code(&translator, &stores).await;
        let err = translator
            .exchange_authorization_code(
                &client("client-1"),
                &code,
                Some(CLIENT_VERIFIER),
                Some("http://localhost:3000/other"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_access_ttl_capped_by_upstream() {
        let upstream = FakeUpstream { expires_in: Some(600), ..fresh_upstream() };
        let (translator, stores) = translator(Arc::new(upstream));
        let code = obtain_code(&translator, &stores).await;

        let response = translator
            .exchange_authorization_code(&client("client-1"), &code, Some(CLIENT_VERIFIER), None)
            .await
            .unwrap();
        assert!(response.expires_in <= 600 && response.expires_in >= 598);
    }

    #[tokio::test]
    async fn test_fallback_ttl_without_expiry_or_refresh() {
        let upstream =
            FakeUpstream { expires_in: None, refresh_token: None, ..FakeUpstream::default() };
        let (translator, stores) = translator(Arc::new(upstream));
        let code = obtain_code(&translator, &stores).await;

        let response = translator
            .exchange_authorization_code(&client("client-1"), &code, Some(CLIENT_VERIFIER), None)
            .await
            .unwrap();
        assert_eq!(response.expires_in, defaults::ACCESS_TOKEN_TTL_NO_REFRESH.as_secs());
    }

    // ─── Refresh ───

    async fn initial_tokens(translator: &TokenTranslator, stores: &ProxyStores) -> TokenResponse {
        let code = obtain_code(translator, stores).await;
        translator
            .exchange_authorization_code(&client("client-1"), &code, Some(CLIENT_VERIFIER), None)
            .await
            .unwrap()
    }

    async fn refresh_with(
        translator: &TokenTranslator,
        refresh_token: &str,
    ) -> OAuthResult<TokenResponse> {
        translator.exchange_refresh_token(&client("client-1"), refresh_token, &[]).await
    }

    #[tokio::test]
    async fn test_refresh_rotates_without_contacting_fresh_upstream() {
        let upstream = Arc::new(fresh_upstream());
        let (translator, stores) = translator(Arc::clone(&upstream));
        let first = initial_tokens(&translator, &stores).await;
        let refresh = first.refresh_token.unwrap();

        let second = refresh_with(&translator, &refresh).await.unwrap();
        assert_ne!(second.refresh_token.as_deref(), Some(refresh.as_str()));
        assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 0);

        let err = refresh_with(&translator, &refresh).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_refresh_contacts_stale_upstream() {
        let upstream = Arc::new(FakeUpstream { expires_in: Some(30), ..fresh_upstream() });
        let (translator, stores) = translator(Arc::clone(&upstream));
        let first = initial_tokens(&translator, &stores).await;

        let second =
            refresh_with(&translator, first.refresh_token.as_deref().unwrap()).await.unwrap();
        assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 1);
        assert!(second.refresh_token.is_some());
    }

    #[tokio::test]
    async fn test_refresh_propagates_upstream_invalid_grant() {
        let upstream =
            Arc::new(FakeUpstream { expires_in: Some(30), fail_refresh: true, ..fresh_upstream() });
        let (translator, stores) = translator(upstream);
        let first = initial_tokens(&translator, &stores).await;

        let err =
            refresh_with(&translator, first.refresh_token.as_deref().unwrap()).await.unwrap_err();
        assert!(
            matches!(err, OAuthError::InvalidGrant(ref m) if m == "upstream refresh token revoked")
        );
    }

    #[tokio::test]
    async fn test_refresh_scope_and_client_binding() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));
        let first = initial_tokens(&translator, &stores).await;
        let refresh = first.refresh_token.unwrap();

        let err = translator
            .exchange_refresh_token(&client("client-1"), &refresh, &["admin".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidScope(_)));

        let err =
            translator.exchange_refresh_token(&client("other"), &refresh, &[]).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));

        let narrowed = translator
            .exchange_refresh_token(&client("client-1"), &refresh, &["read".into()])
            .await
            .unwrap();
        assert_eq!(narrowed.scope.as_deref(), Some("read"));
    }

    #[tokio::test]
    async fn test_narrowed_refresh_keeps_original_grant() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));
        let first = initial_tokens(&translator, &stores).await;

        let narrowed = translator
            .exchange_refresh_token(
                &client("client-1"),
                first.refresh_token.as_deref().unwrap(),
                &["read".into()],
            )
            .await
            .unwrap();
        let verified = translator.verify_access_token(&narrowed.access_token).unwrap();
        assert_eq!(verified.scopes, vec!["read"]);

        let refresh = narrowed.refresh_token.unwrap();
        let record = stores.refresh_tokens.get(&hash_token(&refresh)).await.unwrap().unwrap();
        assert_eq!(record.scopes, vec!["read", "write"]);

        let widened = translator
            .exchange_refresh_token(&client("client-1"), &refresh, &["read".into(), "write".into()])
            .await
            .unwrap();
        assert_eq!(widened.scope.as_deref(), Some("read write"));
    }

    #[tokio::test]
    async fn test_access_token_is_not_a_refresh_token() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));
        let first = initial_tokens(&translator, &stores).await;

        let err = translator
            .exchange_refresh_token(&client("client-1"), &first.access_token, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));
        assert!(translator.verify_access_token(first.refresh_token.as_deref().unwrap()).is_none());
    }

    // ─── Revocation ───

    #[tokio::test]
    async fn test_revoke_refresh_token() {
        let (translator, stores) = translator(Arc::new(fresh_upstream()));
        let first = initial_tokens(&translator, &stores).await;
        let refresh = first.refresh_token.unwrap();

        translator.revoke(&client("other"), &refresh).await.unwrap();
        assert!(stores.refresh_tokens.get(&hash_token(&refresh)).await.unwrap().is_some());

        translator.revoke(&client("client-1"), &refresh).await.unwrap();
        let err = refresh_with(&translator, &refresh).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant(_)));

        translator.revoke(&client("client-1"), "unknown-token").await.unwrap();
    }
}
