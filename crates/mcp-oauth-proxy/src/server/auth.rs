//! Bearer authentication for the protected MCP endpoint.
//!
//! Verified tokens are inserted into request extensions as
//! [`VerifiedToken`]. Failures answer 401 with a `WWW-Authenticate` challenge
//! pointing at the protected-resource metadata (RFC 9728 §5.1), which is how
//! MCP clients discover where to authorize.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use super::transport::ProxyState;
use crate::oauth::jwt::VerifiedToken;

/// Authentication error.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No bearer token on the request.
    MissingToken {
        /// Protected-resource metadata URL for the challenge.
        resource_metadata: String,
    },
    /// Token failed verification or has expired.
    InvalidToken {
        /// Protected-resource metadata URL for the challenge.
        resource_metadata: String,
    },
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken { .. } => write!(f, "Missing bearer token"),
            Self::InvalidToken { .. } => write!(f, "Invalid or expired bearer token"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (challenge, error) = match &self {
            Self::MissingToken { resource_metadata } => {
                (format!("Bearer resource_metadata=\"{resource_metadata}\""), "invalid_request")
            }
            Self::InvalidToken { resource_metadata } => (
                format!(
                    "Bearer error=\"invalid_token\", resource_metadata=\"{resource_metadata}\""
                ),
                "invalid_token",
            ),
        };

        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": error,
                "error_description": self.to_string()
            })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Authentication middleware function.
///
/// Validates the bearer token and injects the [`VerifiedToken`] into request
/// extensions for handlers to access.
pub async fn bearer_auth_middleware(
    State(state): State<Arc<ProxyState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let verified = validate_request(&request, &state)?;
    request.extensions_mut().insert(verified);
    Ok(next.run(request).await)
}

fn validate_request(
    request: &Request<Body>,
    state: &ProxyState,
) -> Result<VerifiedToken, AuthError> {
    let Some(Authorization(bearer)) = request.headers().typed_get::<Authorization<Bearer>>() else {
        let resource_metadata = state.resource_metadata_url.clone();
        return Err(AuthError::MissingToken { resource_metadata });
    };

    state.proxy.verify_access_token(bearer.token()).ok_or_else(|| {
        tracing::debug!(path = %request.uri().path(), "Bearer token rejected");
        AuthError::InvalidToken { resource_metadata: state.resource_metadata_url.clone() }
    })
}
