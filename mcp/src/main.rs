//! `pve-mcp`: MCP stdio server for Proxmox VE.
//!
//! Launched by an AI agent host. Logs go to stderr; stdout carries only
//! JSON-RPC traffic.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pve_mcp::config::Cli;
use pve_mcp::rbac::Authorizer;
use pve_mcp::session::{SessionManager, TokenIssuer};
use pve_mcp::transport::HttpConnector;
use pve_mcp::{mcp, Config, Dispatcher, GatewayContext, PveClient};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pve-mcp: configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let tokens = match TokenIssuer::from_config(&config.auth) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("pve-mcp: auth configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let role = match cli.token.as_deref() {
        Some(token) => match tokens.role_of(token) {
            Some(role) => role,
            None => {
                tracing::warn!(
                    default_role = %config.mcp.default_role,
                    "Bearer token rejected; falling back to default role"
                );
                config.mcp.default_role.clone()
            }
        },
        None => config.mcp.default_role.clone(),
    };

    let client = Arc::new(PveClient::new(HttpConnector::new(config.proxmox.clone())));
    let session = SessionManager::new(Arc::clone(&client), tokens);
    if !session.connect().await {
        tracing::warn!(
            endpoint = %client.endpoint(),
            "Initial connection failed; the liveness monitor will retry"
        );
    }
    let monitor =
        session.spawn_liveness_monitor(Duration::from_secs(config.mcp.liveness_interval_secs));

    let ctx = Arc::new(GatewayContext::from_config(client, &config));
    let dispatcher = Dispatcher::new(ctx, Authorizer::new(config.auth.enable_rbac));

    tracing::info!(
        role = %role,
        operations = dispatcher.list_operations().len(),
        rbac = config.auth.enable_rbac,
        "pve-mcp ready on stdio"
    );

    mcp::run_stdio(&dispatcher, &role).await;

    monitor.abort();
    session.disconnect();
}
