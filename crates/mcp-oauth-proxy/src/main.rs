//! MCP OAuth Proxy - Entry Point
//!
//! Serves the OAuth endpoints and a bearer-protected identity endpoint at the
//! configured MCP path. Upstream settings come from `MCP_PROXY_*` variables,
//! optionally loaded from `.env`.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_oauth_proxy::{OAuthProxy, ProxyConfig, server};

#[derive(Parser, Debug)]
#[command(name = "mcp-oauth-proxy")]
#[command(about = "OAuth 2.0 authorization-code proxy for MCP servers")]
#[command(version)]
struct Cli {
    /// HTTP server port
    #[arg(long, default_value = "8000", env = "PORT")]
    port: u16,

    /// Skip the consent screen and redirect straight to the upstream
    #[arg(long)]
    no_consent: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting MCP OAuth proxy");

    let mut config = ProxyConfig::from_env()?;
    if cli.no_consent {
        config.require_consent = false;
    }

    let mcp_path = format!("{}{}", config.base_path(), config.mcp_path);
    let mcp = server::transport::identity_routes(&mcp_path);
    let proxy = OAuthProxy::new(config)?;

    server::run_http(proxy, mcp, cli.port).await
}
