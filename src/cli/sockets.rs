// ABOUTME: CLI sockets command - list pooled sockets with liveness
//
// Scans the socket directory for files following the pool naming convention
// and dials each one. Nothing is removed; stale sockets are only reported.

use std::path::Path;

use anyhow::Result;

use super::OutputFormat;
use crate::config::AppConfig;
use crate::mcp_pool::{DiscoveredSocket, SocketDiscovery};

/// Execute the sockets command
pub async fn execute(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let sockets = SocketDiscovery::new(config.pool).discover_all().await?;

    match format {
        OutputFormat::Json => output_json(&sockets)?,
        OutputFormat::Text => output_text(&sockets),
    }
    Ok(())
}

fn output_json(sockets: &[DiscoveredSocket]) -> Result<()> {
    let json = serde_json::to_string_pretty(sockets)?;
    println!("{json}");
    Ok(())
}

fn output_text(sockets: &[DiscoveredSocket]) {
    if sockets.is_empty() {
        println!("No pooled sockets found.");
        return;
    }

    println!("{:<24} {:<8} SOCKET", "MCP", "STATE");
    println!("{}", "-".repeat(80));
    for socket in sockets {
        println!(
            "{:<24} {:<8} {}",
            socket.mcp_name,
            liveness_label(socket.is_alive),
            socket.socket_path.display()
        );
    }
}

const fn liveness_label(alive: bool) -> &'static str {
    if alive {
        "live"
    } else {
        "stale"
    }
}
