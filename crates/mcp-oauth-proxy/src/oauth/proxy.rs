//! The proxy facade: wires registry, consent, translator, and discovery
//! together behind the operations the HTTP layer calls.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;

use super::clients::{ClientRegistration, ClientRegistry};
use super::consent::{ConsentManager, ConsentOutcome, ConsentRequest, ConsentResponse};
use super::cookies::{CookieSigner, derive_key};
use super::jwt::VerifiedToken;
use super::models::{RegisteredClient, Transaction};
use super::pkce::{self, PkceBridge};
use super::translator::{CallbackParams, TokenResponse, TokenTranslator};
use super::ui::{ConsentRenderer, DefaultConsentRenderer};
use super::upstream::{HttpUpstreamClient, UpstreamTokenClient};
use super::well_known::WellKnownRouter;
use super::{ProxyStores, append_query, random_token, split_scopes};
use crate::config::ProxyConfig;
use crate::error::{ConfigError, OAuthError, OAuthResult};
use crate::store::CLEANUP_INTERVAL;

/// Parameters of an authorization request after `client_id` is pulled out.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationParams {
    pub response_type: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub resource: Option<String>,
}

/// Why an authorization request did not produce a redirect.
#[derive(Debug)]
pub enum AuthorizeError {
    /// Client or redirect URI could not be trusted; render an error page.
    Rejected(OAuthError),
    /// Redirect to the client carrying an OAuth error.
    Redirect(String),
}

/// `POST /token` form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// `POST /revoke` form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevocationRequest {
    #[serde(default)]
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Client credentials from either the `Authorization` header or the form.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// OAuth authorization-code proxy in front of a single upstream provider.
pub struct OAuthProxy {
    config: Arc<ProxyConfig>,
    stores: ProxyStores,
    clients: ClientRegistry,
    consent: ConsentManager,
    translator: TokenTranslator,
    well_known: Arc<WellKnownRouter>,
    pkce: PkceBridge,
}

impl OAuthProxy {
    /// Proxy with in-memory stores (swept in the background) and an HTTP
    /// upstream client.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let upstream = Arc::new(HttpUpstreamClient::from_config(&config));
        Self::with_parts(config, ProxyStores::in_memory_with_cleanup(CLEANUP_INTERVAL), upstream)
    }

    /// Proxy over caller-supplied stores and upstream client.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_parts(
        config: ProxyConfig,
        stores: ProxyStores,
        upstream: Arc<dyn UpstreamTokenClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let clients = ClientRegistry::new(
            Arc::clone(&stores.clients),
            config.allowed_client_redirect_uris.as_deref(),
        )?;
        let renderer = Arc::new(DefaultConsentRenderer::new(config.server_name.clone()));
        let consent = Self::consent_manager(&config, &stores, renderer);
        let translator = TokenTranslator::new(Arc::clone(&config), stores.clone(), upstream);
        let well_known = Arc::new(WellKnownRouter::from_config(&config));
        let pkce = PkceBridge::new(config.forward_pkce);

        tracing::info!(
            base_url = %config.base_url,
            upstream = %config.upstream_authorization_endpoint,
            forward_pkce = config.forward_pkce,
            require_consent = config.require_consent,
            "OAuth proxy configured"
        );
        Ok(Self { config, stores, clients, consent, translator, well_known, pkce })
    }

    /// Replace the built-in consent page.
    #[must_use]
    pub fn with_consent_renderer(mut self, renderer: Arc<dyn ConsentRenderer>) -> Self {
        self.consent = Self::consent_manager(&self.config, &self.stores, renderer);
        self
    }

    fn consent_manager(
        config: &ProxyConfig,
        stores: &ProxyStores,
        renderer: Arc<dyn ConsentRenderer>,
    ) -> ConsentManager {
        let key = derive_key(config.signing_key.expose_secret().as_bytes(), "consent-cookie");
        ConsentManager::new(
            Arc::clone(&stores.transactions),
            CookieSigner::new(key),
            renderer,
            config.base_url.clone(),
            config.is_https(),
        )
    }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[must_use]
    pub fn well_known(&self) -> Arc<WellKnownRouter> {
        Arc::clone(&self.well_known)
    }

    /// RFC 7591 registration.
    pub async fn register(
        &self,
        registration: ClientRegistration,
    ) -> OAuthResult<(RegisteredClient, Option<String>)> {
        self.clients.register(registration).await
    }

    /// Start an authorization: persist a transaction and return where to send
    /// the browser (the consent page, or the upstream when consent is off).
    pub async fn authorize(
        &self,
        client_id: &str,
        params: AuthorizationParams,
    ) -> Result<String, AuthorizeError> {
        let client = self
            .clients
            .get(client_id)
            .await
            .map_err(AuthorizeError::Rejected)?
            .ok_or_else(|| AuthorizeError::Rejected(OAuthError::invalid_client("Unknown client")))?;
        let redirect_uri = self
            .clients
            .resolve_redirect_uri(&client, params.redirect_uri.as_deref())
            .map_err(AuthorizeError::Rejected)?;

        let state = params.state.as_deref();
        let fail = |error: &str, description: &str| {
            let mut query = vec![("error", error), ("error_description", description)];
            if let Some(state) = state {
                query.push(("state", state));
            }
            AuthorizeError::Redirect(append_query(&redirect_uri, query))
        };

        if params.response_type.as_deref() != Some("code") {
            return Err(fail("unsupported_response_type", "response_type must be 'code'"));
        }
        if let Some(method) = params.code_challenge_method.as_deref() {
            if !pkce::is_supported_method(method) {
                return Err(fail("invalid_request", "Unsupported code_challenge_method"));
            }
        }
        if params.code_challenge.is_none() && client.is_public() {
            return Err(fail("invalid_request", "code_challenge is required for public clients"));
        }

        let scopes = if params.scopes.is_empty() {
            self.config.required_scopes.clone()
        } else {
            params.scopes
        };
        let txn = Transaction {
            txn_id: random_token(),
            client_id: client.client_id.clone(),
            client_name: client.client_name.clone(),
            client_redirect_uri: redirect_uri.clone(),
            client_state: params.state.clone(),
            scopes,
            code_challenge: params.code_challenge,
            code_challenge_method: params.code_challenge_method,
            proxy_code_verifier: self.pkce.prepare(),
            resource: params.resource,
            csrf_token: None,
            csrf_expires_at: None,
            created_at: Utc::now(),
        };
        let ttl = Some(self.config.transaction_ttl);
        if let Err(e) = self.stores.transactions.put(&txn.txn_id, txn.clone(), ttl).await {
            tracing::error!(error = %e, "Failed to persist transaction");
            return Err(fail("server_error", "Internal server error"));
        }
        tracing::info!(
            client_id = %client.client_id,
            scopes = ?txn.scopes,
            "Authorization started"
        );

        if self.config.require_consent {
            Ok(append_query(
                &format!("{}/consent", self.config.base_url),
                [("txn_id", txn.txn_id.as_str())],
            ))
        } else {
            Ok(self.translator.upstream_authorize_url(&txn))
        }
    }

    /// Consent page and form. Approvals come back as a redirect upstream.
    pub async fn consent(
        &self,
        request: ConsentRequest,
        headers: &HeaderMap,
    ) -> OAuthResult<ConsentResponse> {
        let mut response = self.consent.handle(request, headers).await?;
        if let ConsentOutcome::Approved(txn) = &response.outcome {
            let location = self.translator.upstream_authorize_url(txn);
            response.outcome = ConsentOutcome::Redirect(location);
        }
        Ok(response)
    }

    /// Upstream redirect back to the proxy.
    pub async fn callback(&self, params: CallbackParams) -> OAuthResult<String> {
        self.translator.complete_upstream_callback(params).await
    }

    /// Token endpoint.
    pub async fn token(
        &self,
        request: TokenRequest,
        credentials: ClientCredentials,
    ) -> OAuthResult<TokenResponse> {
        let client = self.authenticate(&credentials).await?;

        match request.grant_type.as_str() {
            "authorization_code" => {
                let code = request
                    .code
                    .as_deref()
                    .ok_or_else(|| OAuthError::invalid_request("Missing code"))?;
                self.translator
                    .exchange_authorization_code(
                        &client,
                        code,
                        request.code_verifier.as_deref(),
                        request.redirect_uri.as_deref(),
                    )
                    .await
            }
            "refresh_token" => {
                let refresh_token = request
                    .refresh_token
                    .as_deref()
                    .ok_or_else(|| OAuthError::invalid_request("Missing refresh_token"))?;
                let scopes = split_scopes(request.scope.as_deref());
                self.translator.exchange_refresh_token(&client, refresh_token, &scopes).await
            }
            other => Err(OAuthError::UnsupportedGrantType(other.to_string())),
        }
    }

    /// RFC 7009 revocation.
    pub async fn revoke(&self, token: &str, credentials: ClientCredentials) -> OAuthResult<()> {
        let client = self.authenticate(&credentials).await?;
        self.translator.revoke(&client, token).await
    }

    async fn authenticate(&self, credentials: &ClientCredentials) -> OAuthResult<RegisteredClient> {
        let secret = credentials.client_secret.as_deref();
        self.clients.authenticate(&credentials.client_id, secret).await
    }

    /// Map a bearer token to what it grants.
    #[must_use]
    pub fn verify_access_token(&self, token: &str) -> Option<VerifiedToken> {
        self.translator.verify_access_token(token)
    }
}

impl std::fmt::Debug for OAuthProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProxy")
            .field("base_url", &self.config.base_url)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::consent::ConsentForm;
    use crate::oauth::models::UpstreamTokens;
    use async_trait::async_trait;

    struct StaticUpstream;

    #[async_trait]
    impl UpstreamTokenClient for StaticUpstream {
        async fn exchange_code(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> OAuthResult<UpstreamTokens> {
            Ok(serde_json::from_value(serde_json::json!({
                "access_token": "upstream-at",
                "refresh_token": "upstream-rt",
                "expires_in": 3600
            }))
            .unwrap())
        }

        async fn refresh(&self, _: &str, _: &[String]) -> OAuthResult<UpstreamTokens> {
            Err(OAuthError::invalid_grant("not expected"))
        }
    }

    fn proxy(configure: impl FnOnce(&mut ProxyConfig)) -> OAuthProxy {
        let mut config = ProxyConfig::for_testing("https://idp.example.com");
        configure(&mut config);
        OAuthProxy::with_parts(config, ProxyStores::in_memory(), Arc::new(StaticUpstream)).unwrap()
    }

    async fn public_client(proxy: &OAuthProxy) -> RegisteredClient {
        let (client, _) = proxy
            .register(ClientRegistration {
                client_name: Some("Inspector".into()),
                redirect_uris: Some(vec!["http://localhost:6274/callback".into()]),
                token_endpoint_auth_method: Some("none".into()),
                ..ClientRegistration::default()
            })
            .await
            .unwrap();
        client
    }

    fn params() -> AuthorizationParams {
        AuthorizationParams {
            response_type: Some("code".into()),
            redirect_uri: Some("http://localhost:6274/callback".into()),
            state: Some("s1".into()),
            code_challenge: Some(pkce::s256_challenge("v".repeat(43).as_str())),
            code_challenge_method: Some("S256".into()),
            ..AuthorizationParams::default()
        }
    }

    #[tokio::test]
    async fn test_authorize_returns_consent_url() {
        let proxy = proxy(|_| {});
        let client = public_client(&proxy).await;

        let url = proxy.authorize(&client.client_id, params()).await.unwrap();
        assert!(url.starts_with("https://proxy.example.com/consent?txn_id="));
    }

    #[tokio::test]
    async fn test_authorize_without_consent_goes_upstream() {
        let proxy = proxy(|c| c.require_consent = false);
        let client = public_client(&proxy).await;

        let url = proxy.authorize(&client.client_id, params()).await.unwrap();
        assert!(url.starts_with("https://idp.example.com/authorize?"));
    }

    #[tokio::test]
    async fn test_authorize_rejections() {
        let proxy = proxy(|_| {});
        let client = public_client(&proxy).await;

        assert!(matches!(
            proxy.authorize("unknown", params()).await,
            Err(AuthorizeError::Rejected(OAuthError::InvalidClient(_)))
        ));

        let mut bad_redirect = params();
        bad_redirect.redirect_uri = Some("https://evil.example/cb".into());
        assert!(matches!(
            proxy.authorize(&client.client_id, bad_redirect).await,
            Err(AuthorizeError::Rejected(_))
        ));

        let mut no_pkce = params();
        no_pkce.code_challenge = None;
        let result = proxy.authorize(&client.client_id, no_pkce).await;
        let Err(AuthorizeError::Redirect(url)) = result else {
            panic!("expected redirect");
        };
        assert!(url.starts_with("http://localhost:6274/callback?error=invalid_request"));
        assert!(url.ends_with("state=s1"));

        let mut bad_method = params();
        bad_method.code_challenge_method = Some("S512".into());
        assert!(matches!(
            proxy.authorize(&client.client_id, bad_method).await,
            Err(AuthorizeError::Redirect(_))
        ));
    }

    #[tokio::test]
    async fn test_consent_approval_redirects_upstream() {
        let proxy = proxy(|_| {});
        let client = public_client(&proxy).await;
        let url = proxy.authorize(&client.client_id, params()).await.unwrap();
        let txn_id = url.rsplit('=').next().unwrap().to_string();

        let shown = proxy
            .consent(ConsentRequest::Show { txn_id: Some(txn_id.clone()) }, &HeaderMap::new())
            .await
            .unwrap();
        assert!(matches!(shown.outcome, ConsentOutcome::Page(_)));
        let txn = proxy.stores.transactions.get(&txn_id).await.unwrap().unwrap();
        let csrf_token = txn.csrf_token.unwrap();

        let approved = proxy
            .consent(
                ConsentRequest::Submit(ConsentForm {
                    txn_id,
                    csrf_token,
                    action: "approve".into(),
                }),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        let ConsentOutcome::Redirect(location) = approved.outcome else {
            panic!("expected redirect");
        };
        assert!(location.starts_with("https://idp.example.com/authorize?"));
    }

    #[tokio::test]
    async fn test_token_rejects_unknown_grant_type() {
        let proxy = proxy(|_| {});
        let client = public_client(&proxy).await;

        let err = proxy
            .token(
                TokenRequest { grant_type: "password".into(), ..TokenRequest::default() },
                ClientCredentials { client_id: client.client_id, client_secret: None },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "unsupported_grant_type");
    }
}
