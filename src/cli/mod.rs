// ABOUTME: CLI argument parsing and command routing for mcpool
//
// Provides command-line interface for:
// - Running the pools (serve)
// - Inspecting pooled sockets (sockets)
// - Connecting a stdio MCP client to a pooled socket (bridge)
// - Validating the configuration file (check-config)

pub mod bridge;
pub mod check_config;
pub mod serve;
pub mod sockets;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Share MCP servers across sessions through a supervised process pool
#[derive(Parser)]
#[command(name = "mcpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.mcpool/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Also log to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Config path from `--config` or the default location
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_path)
    }
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the configured servers and keep them healthy until Ctrl-C
    Serve,

    /// List pooled sockets in the socket directory
    Sockets,

    /// Bridge stdin/stdout to a pooled socket, reconnecting on loss
    Bridge(BridgeArgs),

    /// Validate the configuration file
    CheckConfig,
}

/// Arguments for the bridge command
#[derive(clap::Args)]
pub struct BridgeArgs {
    /// Socket path, or the name of a pooled MCP server
    pub socket: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bridge_with_global_flags() {
        let cli = Cli::parse_from(["mcpool", "bridge", "memory", "--config", "/tmp/c.toml", "-v"]);
        assert!(cli.verbose);
        assert_eq!(cli.config_path(), PathBuf::from("/tmp/c.toml"));
        match cli.command {
            Commands::Bridge(args) => assert_eq!(args.socket, "memory"),
            _ => panic!("expected bridge"),
        }
    }

    #[test]
    fn test_parse_sockets_json() {
        let cli = Cli::parse_from(["mcpool", "sockets", "--format", "json"]);
        assert!(matches!(cli.command, Commands::Sockets));
        assert!(matches!(cli.format, OutputFormat::Json));
    }
}
