mod auth;
mod cache;
mod config;
mod health;
mod http;
mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cachistry",
    about = "Caching reverse proxy for container image registries"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/cachistry/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub cache: Arc<cache::Cache>,
    /// Registry alias → upstream host, e.g. `docker.io → registry-1.docker.io`.
    pub registries: HashMap<String, String>,
    pub tokens: auth::TokenCache,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    match config.log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!(config_path = %cli.config, "starting cachistry");

    // ---- Cache ----
    let cache = cache::Cache::open(&config.cache_dir, config.cache_size)
        .context("open object cache")?;

    // ---- Upstream client ----
    let http_client = reqwest::Client::builder()
        .user_agent("cachistry/0.1")
        .build()
        .context("failed to build reqwest client")?;

    // ---- Registry alias table ----
    let registries = config.registry_aliases();
    tracing::info!(
        registries = ?registries.keys().collect::<Vec<_>>(),
        "registry aliases configured"
    );

    // ---- App state ----
    let state = Arc::new(AppState {
        cache: Arc::new(cache),
        http_client,
        registries,
        tokens: auth::TokenCache::new(Duration::from_secs(config.token_ttl)),
        metrics: MetricsRegistry::new(),
        config,
    });

    run_http_server(state).await?;

    tracing::info!("cachistry shut down cleanly");
    Ok(())
}
