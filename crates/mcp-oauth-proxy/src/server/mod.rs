//! HTTP server for the OAuth proxy.

pub mod auth;
pub mod handlers;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use crate::oauth::OAuthProxy;
use transport::ProxyState;

/// Serve the proxy with `mcp` as its protected routes until Ctrl+C.
///
/// # Errors
///
/// Returns error if the listener cannot bind or the server fails.
pub async fn run_http(proxy: OAuthProxy, mcp: Router, port: u16) -> anyhow::Result<()> {
    let base_url = proxy.config().base_url.clone();
    let router = transport::create_router(Arc::new(ProxyState::new(proxy)), mcp);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%base_url, "HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
