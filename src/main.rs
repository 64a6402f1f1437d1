// ABOUTME: Main entry point for mcpool
//
// Binary: mcpool
// Usage: mcpool <COMMAND>
// - serve: start configured servers and keep them healthy
// - sockets: list pooled sockets with liveness
// - bridge: stdio <-> pooled socket transport for MCP clients
// - check-config: validate the configuration file

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use mcpool::cli::{self, Commands};
use mcpool::mcp_pool::PoolConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config_path = args.config_path();

    let log_dir = mcpool::config::AppConfig::load(&config_path)
        .map(|config| config.pool.log_dir())
        .unwrap_or_else(|_| PoolConfig::default().log_dir());
    // The bridge owns stdout for protocol traffic, so it never logs to the terminal
    let to_stderr = args.verbose && !matches!(args.command, Commands::Bridge(_));
    setup_logging(&log_dir, to_stderr);
    setup_panic_handler();

    let result = match args.command {
        Commands::Serve => cli::serve::execute(&config_path, args.format).await,
        Commands::Sockets => cli::sockets::execute(&config_path, args.format).await,
        Commands::Bridge(bridge_args) => cli::bridge::execute(bridge_args, &config_path).await,
        Commands::CheckConfig => cli::check_config::execute(&config_path, args.format),
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

fn setup_logging(log_dir: &std::path::Path, to_stderr: bool) {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let _ = std::fs::create_dir_all(log_dir);

    // JSONL log file with timestamp
    let log_file: PathBuf = log_dir.join(format!(
        "mcpool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file_layer = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    let stderr_layer = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcpool=info".into()),
        )
        .init();
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
