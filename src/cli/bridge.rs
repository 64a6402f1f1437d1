// ABOUTME: CLI bridge command - stdio MCP transport backed by a pooled socket
//
// Meant to be configured as the command of an MCP client's stdio server.
// Logging goes to the log file only; stdout carries protocol traffic.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::BridgeArgs;
use crate::config::AppConfig;
use crate::mcp_pool::{BridgeOptions, PoolConfig, SocketBridge};

/// Execute the bridge command
pub async fn execute(args: BridgeArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let socket_path = resolve_socket(&args.socket, &config.pool);

    let bridge = SocketBridge::new(&socket_path, BridgeOptions::default());
    let exit = bridge
        .run(tokio::io::stdin(), tokio::io::stdout(), CancellationToken::new())
        .await
        .with_context(|| format!("Bridge to {} failed", socket_path.display()))?;

    info!(socket = %socket_path.display(), ?exit, "Bridge finished");
    Ok(())
}

/// A bare server name maps to its pooled socket; anything with a slash is a path
fn resolve_socket(target: &str, pool: &PoolConfig) -> PathBuf {
    if target.contains('/') {
        PathBuf::from(target)
    } else {
        pool.socket_path(target)
    }
}
