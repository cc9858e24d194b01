// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Keystone Devnet Node
//!
//! Entry point for the `keystone-node` binary. Parses CLI arguments,
//! initializes logging and metrics, deploys the escrow ledger, and serves
//! the HTTP/WS API.
//!
//! The binary supports three subcommands:
//!
//! - `run`: deploy the ledger and serve it
//! - `init`: write a default deployment config file
//! - `version`: print build version information

mod api;
mod cli;
mod config;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

use keystone_contracts::config::{CONTRACT_VERSION, EVENT_CHANNEL_CAPACITY};

use cli::{Commands, KeystoneNodeCli};
use config::NodeConfig;
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KeystoneNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Deploys the ledger and serves the API and metrics endpoints until a
/// shutdown signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_DIRECTIVES, args.log_format);

    let node_config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            tracing::info!("no config file given, using the built-in devnet deployment");
            NodeConfig::devnet()
        }
    };

    tracing::info!(
        rpc_port = args.rpc_port,
        metrics_port = args.metrics_port,
        network = %node_config.network,
        "starting keystone-node"
    );

    // --- Ledger ---
    let ledger = node_config.deploy()?;
    tracing::info!(
        ledger = %ledger.address(),
        registry = %ledger.nft_address(),
        seller = %ledger.seller(),
        inspector = %ledger.inspector(),
        lender = %ledger.lender(),
        "escrow parties"
    );

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    node_metrics.set_custody_balance(ledger.custody_balance());

    // --- Event broadcast ---
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (contracts {})",
            env!("CARGO_PKG_VERSION"),
            CONTRACT_VERSION,
        ),
        network: node_config.network.clone(),
        ledger: Arc::new(Mutex::new(ledger)),
        event_tx,
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", api_addr))?;
    tracing::info!("RPC/API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    tracing::info!("keystone-node stopped");
    Ok(())
}

/// Writes the built-in devnet deployment to a config file for editing.
fn init_config(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("keystone_node=info", LogFormat::Pretty);

    if args.output.exists() && !args.force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            args.output.display()
        );
    }

    let config = NodeConfig::devnet();
    config.save(&args.output)?;
    tracing::info!(path = %args.output.display(), "config written");

    println!("Config written to {}", args.output.display());
    println!("  Ledger    : {}", config.escrow.ledger);
    println!("  Registry  : {}", config.escrow.nft_address);
    println!("  Seller    : {}", config.escrow.seller);
    println!("  Inspector : {}", config.escrow.inspector);
    println!("  Lender    : {}", config.escrow.lender);
    for (account, balance) in &config.genesis_balances {
        println!("  Genesis   : {} = {}", account, balance);
    }

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("keystone-node {}", env!("CARGO_PKG_VERSION"));
    println!("contracts     {}", CONTRACT_VERSION);
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
