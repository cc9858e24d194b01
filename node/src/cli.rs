//! # CLI Interface
//!
//! Defines the command-line argument structure for `keystone-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use keystone_contracts::config::{DEFAULT_METRICS_PORT, DEFAULT_RPC_PORT};

use crate::logging::LogFormat;

/// Keystone title escrow devnet node.
///
/// Hosts a single escrow ledger with its title registry and currency bank,
/// and serves it over JSON-RPC, REST, and WebSocket.
#[derive(Parser, Debug)]
#[command(
    name = "keystone-node",
    about = "Keystone title escrow devnet node",
    version,
    propagate_version = true
)]
pub struct KeystoneNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Write a default deployment config file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the deployment config file (JSON).
    ///
    /// When omitted, the node deploys the built-in devnet configuration.
    #[arg(long, short = 'c', env = "KEYSTONE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the JSON-RPC and REST API.
    #[arg(long, env = "KEYSTONE_RPC_PORT", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "KEYSTONE_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "KEYSTONE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the config file.
    #[arg(long, short = 'o', default_value = "keystone.json")]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        KeystoneNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = KeystoneNodeCli::parse_from(["keystone-node", "run"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.rpc_port, DEFAULT_RPC_PORT);
                assert_eq!(args.metrics_port, DEFAULT_METRICS_PORT);
                assert_eq!(args.log_format, LogFormat::Pretty);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_accepts_json_logging() {
        let cli = KeystoneNodeCli::parse_from(["keystone-node", "run", "--log-format", "json"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.log_format, LogFormat::Json),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
