//! HTTP router for the proxy.
//!
//! OAuth endpoints are mounted under `base_url`'s path, discovery documents at
//! the host root, and the caller's MCP routes behind bearer authentication.

use std::sync::Arc;

use axum::{
    Extension, Json, Router, middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::auth::bearer_auth_middleware;
use super::handlers;
use crate::oauth::OAuthProxy;
use crate::oauth::jwt::VerifiedToken;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct ProxyState {
    pub proxy: OAuthProxy,
    /// Advertised in `WWW-Authenticate` challenges.
    pub resource_metadata_url: String,
}

impl ProxyState {
    #[must_use]
    pub fn new(proxy: OAuthProxy) -> Self {
        let resource_metadata_url = proxy.well_known().protected_resource_metadata_url();
        Self { proxy, resource_metadata_url }
    }
}

/// Create the HTTP router.
///
/// `mcp` holds the protected MCP routes at their full host-relative paths and
/// must contain at least one route.
pub fn create_router(state: Arc<ProxyState>, mcp: Router) -> Router {
    let config = state.proxy.config();

    let oauth = Router::new()
        .route("/authorize", get(handlers::handle_authorize))
        .route("/consent", get(handlers::handle_consent_get).post(handlers::handle_consent_post))
        .route(&config.redirect_path, get(handlers::handle_callback))
        .route("/token", post(handlers::handle_token))
        .route("/register", post(handlers::handle_register))
        .route("/revoke", post(handlers::handle_revoke))
        .with_state(Arc::clone(&state));

    let base_path = config.base_path();
    let oauth = if base_path.is_empty() { oauth } else { Router::new().nest(&base_path, oauth) };

    let protected =
        mcp.route_layer(middleware::from_fn_with_state(Arc::clone(&state), bearer_auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .merge(oauth)
        .merge(state.proxy.well_known().routes())
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Minimal protected endpoint: reports who the bearer token belongs to.
pub fn identity_routes(path: &str) -> Router {
    Router::new().route(path, get(handle_identity).post(handle_identity))
}

async fn handle_identity(Extension(token): Extension<VerifiedToken>) -> impl IntoResponse {
    Json(serde_json::json!({
        "client_id": token.client_id,
        "scopes": token.scopes,
        "expires_at": token.expires_at.to_rfc3339(),
        "resource": token.resource
    }))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mcp-oauth-proxy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
