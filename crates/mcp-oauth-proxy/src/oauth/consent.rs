//! Consent screen between the proxy's authorize endpoint and the upstream.
//!
//! The proxy authenticates to the upstream with a single client id, so the
//! upstream's own consent screen cannot tell MCP clients apart. This page does:
//! the user approves or denies each client + redirect URI pair once, and the
//! decision is remembered in signed cookies.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use super::cookies::{self, APPROVED_COOKIE, CONSENT_STATE_COOKIE, CookieSigner, DENIED_COOKIE};
use super::models::{Transaction, chrono_duration};
use super::ui::{ConsentPage, ConsentRenderer};
use crate::config::defaults;
use crate::error::{OAuthError, OAuthResult};
use crate::store::KeyValueStore;

pub const INVALID_TRANSACTION: &str = "Invalid or expired transaction";
pub const INVALID_CONSENT_TOKEN: &str = "Invalid or expired consent token";
pub const INVALID_ACTION: &str = "Invalid action";

/// Max-age of the emptied CSRF cookie written after a decision.
const CLEARED_CSRF_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(60);

/// Form posted by the consent page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsentForm {
    #[serde(default)]
    pub txn_id: String,
    #[serde(default)]
    pub csrf_token: String,
    #[serde(default)]
    pub action: String,
}

/// `GET /consent` or `POST /consent`.
#[derive(Debug, Clone)]
pub enum ConsentRequest {
    Show { txn_id: Option<String> },
    Submit(ConsentForm),
}

/// What the HTTP layer should do next.
#[derive(Debug)]
pub enum ConsentOutcome {
    /// Continue to the upstream authorization endpoint.
    Approved(Box<Transaction>),
    /// 302 to this URL.
    Redirect(String),
    /// 200 with this HTML.
    Page(String),
    /// 400 error page with this message.
    Invalid(&'static str),
}

#[derive(Debug)]
pub struct ConsentResponse {
    pub outcome: ConsentOutcome,
    /// `Set-Cookie` header values.
    pub set_cookies: Vec<String>,
}

impl ConsentResponse {
    fn bare(outcome: ConsentOutcome) -> Self {
        Self { outcome, set_cookies: Vec::new() }
    }
}

/// Handles the consent page and its form submission.
pub struct ConsentManager {
    transactions: Arc<dyn KeyValueStore<Transaction>>,
    signer: CookieSigner,
    renderer: Arc<dyn ConsentRenderer>,
    base_url: String,
    is_https: bool,
}

impl ConsentManager {
    #[must_use]
    pub fn new(
        transactions: Arc<dyn KeyValueStore<Transaction>>,
        signer: CookieSigner,
        renderer: Arc<dyn ConsentRenderer>,
        base_url: impl Into<String>,
        is_https: bool,
    ) -> Self {
        Self { transactions, signer, renderer, base_url: base_url.into(), is_https }
    }

    /// Dispatch a consent request.
    pub async fn handle(
        &self,
        request: ConsentRequest,
        headers: &HeaderMap,
    ) -> OAuthResult<ConsentResponse> {
        match request {
            ConsentRequest::Show { txn_id } => self.show(txn_id.as_deref(), headers).await,
            ConsentRequest::Submit(form) => self.submit(form, headers).await,
        }
    }

    async fn show(
        &self,
        txn_id: Option<&str>,
        headers: &HeaderMap,
    ) -> OAuthResult<ConsentResponse> {
        let Some(mut txn) = self.load_transaction(txn_id).await? else {
            return Ok(ConsentResponse::bare(ConsentOutcome::Invalid(INVALID_TRANSACTION)));
        };

        let key = cookies::client_key(&txn.client_id, &txn.client_redirect_uri);

        if self.read_list(headers, APPROVED_COOKIE).contains(&key) {
            tracing::debug!(client_id = %txn.client_id, "Consent previously approved");
            return Ok(ConsentResponse::bare(ConsentOutcome::Approved(Box::new(txn))));
        }
        if self.read_list(headers, DENIED_COOKIE).contains(&key) {
            tracing::debug!(client_id = %txn.client_id, "Consent previously denied");
            return Ok(ConsentResponse::bare(ConsentOutcome::Redirect(deny_redirect(&txn))));
        }

        let csrf_token = super::random_token();
        txn.csrf_token = Some(csrf_token.clone());
        txn.csrf_expires_at = Some(Utc::now() + chrono_duration(defaults::CSRF_TTL));
        self.transactions.put(&txn.txn_id, txn.clone(), Some(defaults::CSRF_TTL)).await?;

        let html = self.renderer.render(&ConsentPage {
            client_name: txn.client_name.clone(),
            client_id: txn.client_id.clone(),
            redirect_uri: txn.client_redirect_uri.clone(),
            scopes: txn.scopes.clone(),
            txn_id: txn.txn_id.clone(),
            csrf_token: csrf_token.clone(),
            action_url: format!("{}/consent", self.base_url),
        });

        Ok(ConsentResponse {
            outcome: ConsentOutcome::Page(html),
            set_cookies: vec![self.list_cookie(
                CONSENT_STATE_COOKIE,
                &[csrf_token],
                defaults::CSRF_TTL,
            )],
        })
    }

    async fn submit(&self, form: ConsentForm, headers: &HeaderMap) -> OAuthResult<ConsentResponse> {
        let Some(txn) = self.load_transaction(Some(&form.txn_id)).await? else {
            return Ok(ConsentResponse::bare(ConsentOutcome::Invalid(INVALID_TRANSACTION)));
        };

        let csrf_ok = match (&txn.csrf_token, txn.csrf_expires_at) {
            (Some(expected), Some(expires_at)) => {
                expected.len() == form.csrf_token.len()
                    && bool::from(expected.as_bytes().ct_eq(form.csrf_token.as_bytes()))
                    && Utc::now() <= expires_at
            }
            _ => false,
        };
        if !csrf_ok {
            tracing::warn!(client_id = %txn.client_id, "Consent submitted with invalid CSRF token");
            return Ok(ConsentResponse::bare(ConsentOutcome::Invalid(INVALID_CONSENT_TOKEN)));
        }

        let key = cookies::client_key(&txn.client_id, &txn.client_redirect_uri);
        let (base, outcome) = match form.action.as_str() {
            "approve" => {
                tracing::info!(client_id = %txn.client_id, "Consent approved");
                (APPROVED_COOKIE, ConsentOutcome::Approved(Box::new(txn)))
            }
            "deny" => {
                tracing::info!(client_id = %txn.client_id, "Consent denied");
                (DENIED_COOKIE, ConsentOutcome::Redirect(deny_redirect(&txn)))
            }
            _ => return Ok(ConsentResponse::bare(ConsentOutcome::Invalid(INVALID_ACTION))),
        };

        let mut decided = self.read_list(headers, base);
        if !decided.contains(&key) {
            decided.push(key);
        }
        decided.sort();

        Ok(ConsentResponse {
            outcome,
            set_cookies: vec![
                self.list_cookie(base, &decided, defaults::CONSENT_COOKIE_MAX_AGE),
                self.list_cookie(CONSENT_STATE_COOKIE, &[], CLEARED_CSRF_MAX_AGE),
            ],
        })
    }

    async fn load_transaction(&self, txn_id: Option<&str>) -> OAuthResult<Option<Transaction>> {
        match txn_id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(self.transactions.get(id).await?),
            None => Ok(None),
        }
    }

    /// Signed list from a cookie. Missing or unverifiable cookies read as empty.
    fn read_list(&self, headers: &HeaderMap, base: &str) -> Vec<String> {
        cookies::read_cookie(headers, base, self.is_https)
            .and_then(|raw| {
                let decoded = self.signer.decode_list(&raw);
                if decoded.is_none() {
                    tracing::debug!(cookie = base, "Ignoring cookie with invalid signature");
                }
                decoded
            })
            .unwrap_or_default()
    }

    fn list_cookie(&self, base: &str, items: &[String], max_age: std::time::Duration) -> String {
        cookies::set_cookie_header(
            &cookies::cookie_name(base, self.is_https),
            &self.signer.encode_list(items),
            max_age,
            self.is_https,
        )
    }
}

impl std::fmt::Debug for ConsentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentManager")
            .field("base_url", &self.base_url)
            .field("is_https", &self.is_https)
            .finish()
    }
}

/// Client callback URL carrying `error=access_denied` and the original state.
#[must_use]
pub fn deny_redirect(txn: &Transaction) -> String {
    let denied = OAuthError::access_denied("The user denied the request");
    let description = denied.description();
    super::append_query(
        &txn.client_redirect_uri,
        [
            ("error", denied.error_code()),
            ("error_description", description.as_str()),
            ("state", txn.client_state.as_deref().unwrap_or_default()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::cookies::derive_key;
    use crate::oauth::ui::DefaultConsentRenderer;
    use crate::store::MemoryStore;
    use axum::http::{HeaderValue, header};

    const BASE_URL: &str = "https://proxy.example.com";

    fn manager() -> (ConsentManager, Arc<MemoryStore<Transaction>>) {
        let store = Arc::new(MemoryStore::new("transactions"));
        let manager = ConsentManager::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore<Transaction>>,
            CookieSigner::new(derive_key(b"secret", "consent")),
            Arc::new(DefaultConsentRenderer::default()),
            BASE_URL,
            true,
        );
        (manager, store)
    }

    fn transaction() -> Transaction {
        Transaction {
            txn_id: "txn-1".into(),
            client_id: "client-1".into(),
            client_name: Some("Test Client".into()),
            client_redirect_uri: "http://localhost:3000/callback".into(),
            client_state: Some("xyz".into()),
            scopes: vec!["read".into()],
            code_challenge: None,
            code_challenge_method: None,
            proxy_code_verifier: None,
            resource: None,
            csrf_token: None,
            csrf_expires_at: None,
            created_at: Utc::now(),
        }
    }

    async fn seeded() -> (ConsentManager, Arc<MemoryStore<Transaction>>) {
        let (manager, store) = manager();
        store.put("txn-1", transaction(), None).await.unwrap();
        (manager, store)
    }

    fn cookie_headers(pairs: &[(String, String)]) -> HeaderMap {
        let line = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("; ");
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(&line).unwrap());
        headers
    }

    fn show(txn_id: &str) -> ConsentRequest {
        ConsentRequest::Show { txn_id: Some(txn_id.into()) }
    }

    fn submit(csrf: &str, action: &str) -> ConsentRequest {
        ConsentRequest::Submit(ConsentForm {
            txn_id: "txn-1".into(),
            csrf_token: csrf.into(),
            action: action.into(),
        })
    }

    // ─── Show ───

    #[tokio::test]
    async fn test_show_unknown_transaction() {
        let (manager, _) = manager();
        let response = manager.handle(show("missing"), &HeaderMap::new()).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Invalid(INVALID_TRANSACTION)));

        let response =
            manager.handle(ConsentRequest::Show { txn_id: None }, &HeaderMap::new()).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Invalid(INVALID_TRANSACTION)));
    }

    #[tokio::test]
    async fn test_show_renders_page_and_sets_only_csrf_cookie() {
        let (manager, store) = seeded().await;
        let response = manager.handle(show("txn-1"), &HeaderMap::new()).await.unwrap();

        let ConsentOutcome::Page(html) = response.outcome else { panic!("expected page") };
        let stored = store.get("txn-1").await.unwrap().unwrap();
        let csrf = stored.csrf_token.unwrap();
        assert!(stored.csrf_expires_at.is_some());
        assert!(html.contains(&csrf));
        assert!(html.contains("Test Client"));

        assert_eq!(response.set_cookies.len(), 1);
        let cookie = &response.set_cookies[0];
        assert!(cookie.starts_with("__Host-MCP_CONSENT_STATE="));
        assert!(cookie.contains("Max-Age=900"));
        assert!(cookie.contains("Secure"));
    }

    #[tokio::test]
    async fn test_show_with_approved_cookie_skips_page() {
        let (manager, _) = seeded().await;
        let key = cookies::client_key("client-1", "http://localhost:3000/callback/");
        let headers = cookie_headers(&[(
            "__Host-MCP_APPROVED_CLIENTS".into(),
            manager.signer.encode_list(&[key]),
        )]);

        let response = manager.handle(show("txn-1"), &headers).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Approved(txn) if txn.txn_id == "txn-1"));
        assert!(response.set_cookies.is_empty());
    }

    #[tokio::test]
    async fn test_show_with_denied_cookie_redirects_to_client() {
        let (manager, _) = seeded().await;
        let key = cookies::client_key("client-1", "http://localhost:3000/callback");
        let headers =
            cookie_headers(&[("__MCP_DENIED_CLIENTS".into(), manager.signer.encode_list(&[key]))]);

        let response = manager.handle(show("txn-1"), &headers).await.unwrap();
        let ConsentOutcome::Redirect(location) = response.outcome else {
            panic!("expected redirect")
        };
        assert_eq!(
            location,
            "http://localhost:3000/callback?error=access_denied\
             &error_description=The+user+denied+the+request&state=xyz"
        );
    }

    #[tokio::test]
    async fn test_forged_cookie_fails_open_to_page() {
        let (manager, _) = seeded().await;
        let key = cookies::client_key("client-1", "http://localhost:3000/callback");
        let forger = CookieSigner::new(derive_key(b"attacker", "consent"));
        let headers = cookie_headers(&[(
            "__Host-MCP_APPROVED_CLIENTS".into(),
            forger.encode_list(&[key]),
        )]);

        let response = manager.handle(show("txn-1"), &headers).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Page(_)));
    }

    // ─── Submit ───

    async fn rendered_csrf(manager: &ConsentManager, store: &MemoryStore<Transaction>) -> String {
        manager.handle(show("txn-1"), &HeaderMap::new()).await.unwrap();
        store.get("txn-1").await.unwrap().unwrap().csrf_token.unwrap()
    }

    #[tokio::test]
    async fn test_approve_sets_cookie_and_clears_csrf() {
        let (manager, store) = seeded().await;
        let csrf = rendered_csrf(&manager, &store).await;

        let response = manager.handle(submit(&csrf, "approve"), &HeaderMap::new()).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Approved(_)));
        assert_eq!(response.set_cookies.len(), 2);

        let approved = &response.set_cookies[0];
        assert!(approved.starts_with("__Host-MCP_APPROVED_CLIENTS="));
        assert!(approved.contains("Max-Age=31536000"));
        let value = approved.split(';').next().unwrap().split_once('=').unwrap().1;
        let key = cookies::client_key("client-1", "http://localhost:3000/callback");
        assert_eq!(manager.signer.decode_list(value), Some(vec![key]));

        let cleared = &response.set_cookies[1];
        assert!(cleared.starts_with("__Host-MCP_CONSENT_STATE="));
        assert!(cleared.contains("Max-Age=60"));
        let value = cleared.split(';').next().unwrap().split_once('=').unwrap().1;
        assert_eq!(manager.signer.decode_list(value), Some(vec![]));
    }

    #[tokio::test]
    async fn test_deny_redirects_with_access_denied() {
        let (manager, store) = seeded().await;
        let csrf = rendered_csrf(&manager, &store).await;

        let response = manager.handle(submit(&csrf, "deny"), &HeaderMap::new()).await.unwrap();
        let ConsentOutcome::Redirect(location) = response.outcome else {
            panic!("expected redirect")
        };
        assert!(location.contains("error=access_denied"));
        assert!(location.contains("state=xyz"));
        assert!(response.set_cookies[0].starts_with("__Host-MCP_DENIED_CLIENTS="));
    }

    #[tokio::test]
    async fn test_wrong_csrf_rejected_regardless_of_action() {
        let (manager, store) = seeded().await;
        rendered_csrf(&manager, &store).await;

        for action in ["approve", "deny", "bogus"] {
            let response =
                manager.handle(submit("wrong", action), &HeaderMap::new()).await.unwrap();
            assert!(matches!(response.outcome, ConsentOutcome::Invalid(INVALID_CONSENT_TOKEN)));
            assert!(response.set_cookies.is_empty());
        }
    }

    #[tokio::test]
    async fn test_submit_before_render_rejected() {
        let (manager, _) = seeded().await;
        let response = manager.handle(submit("", "approve"), &HeaderMap::new()).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Invalid(INVALID_CONSENT_TOKEN)));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let (manager, store) = seeded().await;
        let csrf = rendered_csrf(&manager, &store).await;
        let response = manager.handle(submit(&csrf, "maybe"), &HeaderMap::new()).await.unwrap();
        assert!(matches!(response.outcome, ConsentOutcome::Invalid(INVALID_ACTION)));
    }
}
