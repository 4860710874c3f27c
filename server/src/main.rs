#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # pve-gateway
//!
//! HTTP front end for the pve-mcp dispatcher. Callers authenticate with a
//! JWT whose `role` claim selects their permissions.
//!
//! ## Subcommands
//!
//! - `pve-gateway serve` (default): run the HTTP server
//! - `pve-gateway token --sub <name> --role <role>`: mint a bearer token
//!
//! ## API surface
//!
//! | Method | Path                      | Auth | Description                        |
//! |--------|---------------------------|------|------------------------------------|
//! | GET    | `/api/health`             | No   | Liveness probe + Proxmox reachability |
//! | GET    | `/api/tools`              | Yes  | Operation definitions              |
//! | POST   | `/api/tools/call`         | Yes  | Run an operation `{name, arguments}` |
//! | GET    | `/api/resources`          | Yes  | Resource descriptors               |
//! | GET    | `/api/resources/read`     | Yes  | Read `?uri=proxmox://...`          |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, startup, graceful shutdown
//! lib.rs           router assembly (auth, concurrency limit, tracing)
//! auth.rs          JWT bearer middleware
//! state.rs         AppState
//! routes/
//!   health.rs      GET /api/health
//!   tools.rs       tool and resource endpoints
//! ```

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pve_gateway::{router, AppState};
use pve_mcp::rbac::{Authorizer, ROLES};
use pve_mcp::session::{SessionManager, TokenIssuer};
use pve_mcp::transport::HttpConnector;
use pve_mcp::{Config, Dispatcher, GatewayContext, PveClient};
use serde_json::{json, Map};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP gateway for managing Proxmox VE clusters.
#[derive(Parser)]
#[command(name = "pve-gateway", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
    /// Print a signed bearer token.
    Token {
        /// Subject claim, e.g. the agent's name.
        #[arg(long)]
        sub: String,
        /// Role claim: admin, operator or viewer.
        #[arg(long, default_value = "viewer")]
        role: String,
        /// Lifetime in minutes (default from `auth.expire_minutes`).
        #[arg(long)]
        ttl_minutes: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pve-gateway: configuration error: {e}");
            exit(1);
        }
    };

    let tokens = match TokenIssuer::from_config(&config.auth) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("pve-gateway: auth configuration error: {e}");
            exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config, tokens).await,
        Commands::Token {
            sub,
            role,
            ttl_minutes,
        } => mint_token(&tokens, &sub, &role, ttl_minutes),
    }
}

fn mint_token(tokens: &TokenIssuer, sub: &str, role: &str, ttl_minutes: Option<u64>) {
    if !ROLES.contains(&role) {
        eprintln!("pve-gateway: unknown role '{role}' (expected one of {ROLES:?})");
        exit(1);
    }
    let mut claims = Map::new();
    claims.insert("sub".into(), json!(sub));
    claims.insert("role".into(), json!(role));
    let ttl = ttl_minutes.map(|m| Duration::from_secs(m * 60));
    match tokens.issue(claims, ttl) {
        Ok(token) => println!("{token}"),
        Err(e) => {
            eprintln!("pve-gateway: failed to sign token: {e}");
            exit(1);
        }
    }
}

async fn run_server(config: Config, tokens: TokenIssuer) {
    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("pve-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(PveClient::new(HttpConnector::new(config.proxmox.clone())));
    let session = SessionManager::new(Arc::clone(&client), tokens.clone());
    if !session.connect().await {
        tracing::warn!(
            endpoint = %client.endpoint(),
            "Initial connection failed; the liveness monitor will retry"
        );
    }
    let monitor =
        session.spawn_liveness_monitor(Duration::from_secs(config.mcp.liveness_interval_secs));

    let ctx = Arc::new(GatewayContext::from_config(client, &config));
    let dispatcher = Arc::new(Dispatcher::new(
        ctx,
        Authorizer::new(config.auth.enable_rbac),
    ));
    if !config.auth.enable_rbac {
        tracing::warn!("RBAC disabled: every caller may run every operation");
    }

    let app = router(
        AppState::new(dispatcher, tokens),
        config.server.max_concurrent_operations,
    );

    let listen = config.server.listen_addr();
    let listener = match TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(listen = %listen, error = %e, "Failed to bind");
            exit(1);
        }
    };
    info!("Listening on {listen}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    info!("Shutting down...");
    monitor.abort();
    session.disconnect();
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM; waiting for SIGINT only");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
