//! Google Workspace Bridge
//!
//! Single-binary local service that:
//! 1. Authorizes a Google account with the PKCE loopback flow
//! 2. Keeps the tokens encrypted on disk and refreshes them in the background
//! 3. Serves line-delimited JSON tool calls on stdin/stdout, running each
//!    Workspace API call through rate limiting, retry and error classification
//!
//! Logs go to stderr as JSON; stdout carries only protocol responses.

mod bridge;
mod cli;
mod config;
mod metrics;
mod serve;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::Bridge;
use crate::cli::{Cli, Command, USAGE};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse(std::env::args().skip(1))?;
    if cli.command == Command::Help {
        print!("{USAGE}");
        return Ok(());
    }

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        client_id = %config.oauth.client_id,
        redirect_uri = %config.oauth.redirect_uri,
        metrics = config.metrics.listen_addr.is_some(),
        "configuration loaded"
    );

    let bridge = Arc::new(Bridge::build(&config)?);
    info!(services = ?bridge.default_services(), "bridge ready");

    match cli.command {
        Command::Auth { services } => {
            let auth = bridge.authenticate(&services).await?;
            let summary = json!({
                "email": auth.user.email,
                "scopes": auth.tokens.scope_list(),
                "expires_at": auth.tokens.expires_at,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Status => {
            let status = bridge.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Revoke => {
            bridge.revoke().await?;
            println!("revoked");
        }
        Command::Serve => run_server(bridge, &config).await?,
        Command::Help => {}
    }
    Ok(())
}

async fn run_server(bridge: Arc<Bridge>, config: &Config) -> Result<()> {
    info!("starting google-workspace-bridge");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let metrics_server = match config.metrics.listen_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
            info!(%addr, "serving metrics");
            let app = metrics::router(prometheus);
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "metrics server failed");
                }
            }))
        }
        None => None,
    };

    let refresh = workspace_auth::spawn_refresh_task(
        bridge.tokens().clone(),
        Duration::from_secs(config.refresh.interval_secs),
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = serve::run(bridge, stdin, tokio::io::stdout(), shutdown_signal()).await;

    refresh.abort();
    if let Some(server) = metrics_server {
        server.abort();
    }
    result.context("tool protocol I/O failed")?;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
