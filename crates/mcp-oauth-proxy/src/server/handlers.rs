//! OAuth endpoint handlers.
//!
//! Implements:
//! - RFC 6749: Authorization and Token endpoints
//! - RFC 7591: Dynamic Client Registration
//! - RFC 7009: Token Revocation
//! - the consent page and upstream callback

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use serde::Deserialize;

use super::transport::ProxyState;
use crate::error::OAuthError;
use crate::oauth::clients::ClientRegistration;
use crate::oauth::consent::{ConsentForm, ConsentOutcome, ConsentRequest, ConsentResponse};
use crate::oauth::proxy::{
    AuthorizationParams, AuthorizeError, ClientCredentials, RevocationRequest, TokenRequest,
};
use crate::oauth::translator::{CallbackParams, TokenResponse};
use crate::oauth::ui::{CONTENT_SECURITY_POLICY, render_error_page};
use crate::oauth::split_scopes;

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
        if status.is_server_error() {
            tracing::error!(error = %self, "OAuth request failed");
        } else {
            tracing::debug!(error = %self, "OAuth request rejected");
        }

        let mut response = (
            status,
            Json(serde_json::json!({
                "error": self.error_code(),
                "error_description": self.description()
            })),
        )
            .into_response();
        no_store(response.headers_mut());
        response
    }
}

// ─── Authorization Endpoint ───

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub resource: Option<String>,
}

/// `GET /authorize`
///
/// Errors before the client and redirect URI are trusted render a page; later
/// errors go back to the client's redirect URI.
pub async fn handle_authorize(
    State(state): State<Arc<ProxyState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let Some(client_id) = query.client_id.as_deref().filter(|id| !id.is_empty()) else {
        return html_page(StatusCode::BAD_REQUEST, render_error_page("Missing client_id"));
    };

    let params = AuthorizationParams {
        response_type: query.response_type.clone(),
        redirect_uri: query.redirect_uri.clone(),
        state: query.state.clone(),
        scopes: split_scopes(query.scope.as_deref()),
        code_challenge: query.code_challenge.clone(),
        code_challenge_method: query.code_challenge_method.clone(),
        resource: query.resource.clone(),
    };

    match state.proxy.authorize(client_id, params).await {
        Ok(location) | Err(AuthorizeError::Redirect(location)) => found(&location),
        Err(AuthorizeError::Rejected(e)) => {
            tracing::warn!(client_id = %client_id, error = %e, "Authorization request rejected");
            let status = if e.status_code() >= 500 {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            html_page(status, render_error_page(&e.description()))
        }
    }
}

// ─── Consent ───

#[derive(Debug, Deserialize)]
pub struct ConsentQuery {
    pub txn_id: Option<String>,
}

/// `GET /consent`
pub async fn handle_consent_get(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Query(query): Query<ConsentQuery>,
) -> Response {
    let result = state.proxy.consent(ConsentRequest::Show { txn_id: query.txn_id }, &headers).await;
    consent_response(result)
}

/// `POST /consent`
pub async fn handle_consent_post(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Form(form): Form<ConsentForm>,
) -> Response {
    let result = state.proxy.consent(ConsentRequest::Submit(form), &headers).await;
    consent_response(result)
}

fn consent_response(result: Result<ConsentResponse, OAuthError>) -> Response {
    let consent = match result {
        Ok(consent) => consent,
        Err(e) => {
            tracing::error!(error = %e, "Consent handling failed");
            return html_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                render_error_page("Internal server error"),
            );
        }
    };

    let mut response = match consent.outcome {
        ConsentOutcome::Page(html) => html_page(StatusCode::OK, html),
        ConsentOutcome::Redirect(location) => found(&location),
        ConsentOutcome::Invalid(message) => {
            html_page(StatusCode::BAD_REQUEST, render_error_page(message))
        }
        ConsentOutcome::Approved(_) => html_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            render_error_page("Internal server error"),
        ),
    };

    for cookie in consent.set_cookies {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed Set-Cookie value"),
        }
    }
    response
}

// ─── Upstream Callback ───

/// `GET <redirect_path>`
pub async fn handle_callback(
    State(state): State<Arc<ProxyState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.proxy.callback(params).await {
        Ok(location) => found(&location),
        Err(e) => {
            tracing::warn!(error = %e, "Upstream callback rejected");
            let status = if e.status_code() >= 500 {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            html_page(status, render_error_page(&e.description()))
        }
    }
}

// ─── Token Endpoint ───

/// `POST /token`
///
/// Client credentials come from HTTP Basic when present, otherwise from the form.
pub async fn handle_token(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Form(form): Form<TokenRequest>,
) -> Response {
    let Some(credentials) =
        client_credentials(&headers, form.client_id.clone(), form.client_secret.clone())
    else {
        return OAuthError::invalid_client("Missing client credentials").into_response();
    };

    let grant_type = form.grant_type.clone();
    match state.proxy.token(form, credentials).await {
        Ok(tokens) => token_success(&tokens),
        Err(e) => {
            tracing::warn!(grant_type = %grant_type, error = %e, "Token request failed");
            e.into_response()
        }
    }
}

/// Build a token response with required OAuth 2.0 cache headers (RFC 6749 §5.1).
fn token_success(tokens: &TokenResponse) -> Response {
    let mut response = Json(tokens).into_response();
    no_store(response.headers_mut());
    response
}

// ─── RFC 7591: Dynamic Client Registration ───

/// `POST /register`
pub async fn handle_register(
    State(state): State<Arc<ProxyState>>,
    Json(request): Json<ClientRegistration>,
) -> Response {
    let (client, secret) = match state.proxy.register(request).await {
        Ok(registered) => registered,
        Err(e) => return e.into_response(),
    };

    let mut body = serde_json::json!({
        "client_id": client.client_id,
        "client_id_issued_at": client.created_at.timestamp(),
        "client_name": client.client_name,
        "redirect_uris": client.redirect_uris,
        "grant_types": client.grant_types,
        "response_types": client.response_types,
        "token_endpoint_auth_method": client.token_endpoint_auth_method
    });
    if let Some(secret) = secret {
        body["client_secret"] = serde_json::Value::String(secret);
        body["client_secret_expires_at"] = serde_json::Value::from(0);
    }

    let mut response = (StatusCode::CREATED, Json(body)).into_response();
    no_store(response.headers_mut());
    response
}

// ─── RFC 7009: Token Revocation ───

/// `POST /revoke`
pub async fn handle_revoke(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Form(form): Form<RevocationRequest>,
) -> Response {
    let Some(credentials) =
        client_credentials(&headers, form.client_id.clone(), form.client_secret.clone())
    else {
        return OAuthError::invalid_client("Missing client credentials").into_response();
    };
    if form.token.is_empty() {
        return OAuthError::invalid_request("Missing token").into_response();
    }

    match state.proxy.revoke(&form.token, credentials).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

// ─── Helpers ───

fn client_credentials(
    headers: &HeaderMap,
    form_client_id: Option<String>,
    form_client_secret: Option<String>,
) -> Option<ClientCredentials> {
    if let Some(Authorization(basic)) = headers.typed_get::<Authorization<Basic>>() {
        let secret = basic.password();
        return Some(ClientCredentials {
            client_id: basic.username().to_string(),
            client_secret: (!secret.is_empty()).then(|| secret.to_string()),
        });
    }
    form_client_id
        .filter(|id| !id.is_empty())
        .map(|client_id| ClientCredentials { client_id, client_secret: form_client_secret })
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// HTML response that cannot be framed, cached, or used to load resources.
fn html_page(status: StatusCode, html: String) -> Response {
    let mut response =
        (status, [(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response();
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    no_store(headers);
    response
}

fn no_store(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}
