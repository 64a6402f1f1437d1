// ABOUTME: CLI serve command - run both pools until interrupted
//
// Starts every configured server, runs the health monitors and the event
// flush loop, and shuts everything down on Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::OutputFormat;
use crate::config::AppConfig;
use crate::mcp_pool::events::{EventAggregator, DEFAULT_FLUSH_INTERVAL};
use crate::mcp_pool::process_supervisor::ProcessSupervisor;
use crate::mcp_pool::{HttpPool, ProxyContext, SocketPool};

/// Execute the serve command
pub async fn execute(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("config error: {problem}");
        }
        bail!("{} problem(s) in {}", problems.len(), config_path.display());
    }

    let root = CancellationToken::new();
    let events = Arc::new(EventAggregator::new(DEFAULT_FLUSH_INTERVAL));
    let ctx = ProxyContext {
        config: Arc::new(config.pool.clone()),
        events: events.clone(),
        supervisor: ProcessSupervisor::default(),
    };
    let flush_loop = Arc::clone(&events).spawn_flush_loop(root.child_token());

    let socket_pool = Arc::new(
        SocketPool::new(ctx.clone(), &root).context("Failed to create socket pool")?,
    );
    let http_pool = Arc::new(HttpPool::new(ctx, &root));

    let stdio_servers = config.stdio_servers();
    if stdio_servers.is_empty() {
        info!("No stdio servers configured");
    } else {
        match socket_pool.initialize(&stdio_servers).await {
            Ok(running) => info!(running, "Socket pool initialized"),
            Err(e) => warn!(error = %e, "Socket pool unavailable"),
        }
    }

    for (name, spec) in config.http_servers() {
        if let Err(e) = http_pool.start(&name, spec).await {
            warn!(mcp = %name, error = %e, "Failed to start HTTP server");
        }
    }
    http_pool.start_health_monitor();

    print_summary(&socket_pool, &http_pool, format)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, shutting down");

    tokio::join!(socket_pool.shutdown(), http_pool.shutdown());
    root.cancel();
    if flush_loop.await.is_err() {
        warn!("Event flush loop panicked");
    }

    Ok(())
}

fn print_summary(socket_pool: &SocketPool, http_pool: &HttpPool, format: OutputFormat) -> Result<()> {
    let sockets = socket_pool.list();
    let http = http_pool.list();

    match format {
        OutputFormat::Json => {
            let summary = serde_json::json!({ "sockets": sockets, "http": http });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!(
                "mcpool serving {} socket and {} HTTP server(s); Ctrl-C to stop",
                socket_pool.running_count(),
                http_pool.running_count()
            );
            for proxy in &sockets {
                let owner = if proxy.started_by_us { "" } else { " (external)" };
                println!(
                    "  {:<20} {:<18} {}{owner}",
                    proxy.name,
                    proxy.status,
                    proxy.socket_path.display()
                );
            }
            for server in &http {
                let owner = if server.started_by_us { "" } else { " (external)" };
                println!("  {:<20} {:<18} {}{owner}", server.name, server.status, server.url);
            }
        }
    }
    Ok(())
}
