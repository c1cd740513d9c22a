//! `airs-mcp-router`: process bootstrap for the tool-server router.
//!
//! Loads a TOML configuration file, builds the server registry and shared
//! proxy state from it, and serves the five client-facing routes on the
//! given bind address.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use airs_mcp_router::config::RouterConfig;
use airs_mcp_router::http::{build_router, AppState};
use airs_mcp_router::observability::TracingLogSink;
use airs_mcp_router::registry::ServerRegistry;

#[derive(Parser)]
#[command(name = "airs-mcp-router")]
#[command(about = "JSON-RPC 2.0 tool-server router/proxy")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file (server registry + app settings).
    #[arg(short, long, default_value = "router.toml")]
    config: std::path::PathBuf,

    /// Address to bind the HTTP listener on.
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airs_mcp_router=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = RouterConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(servers = config.servers.len(), "configuration loaded");

    let registry = ServerRegistry::new(config.servers);
    let state = AppState::new(registry, Arc::new(TracingLogSink), config.app.save_log);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(addr = %cli.bind, "router listening");

    axum::serve(listener, router)
        .await
        .context("router server exited with an error")
}
