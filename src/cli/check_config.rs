// ABOUTME: CLI check-config command - validate the configuration file

use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;

use super::OutputFormat;
use crate::config::{AppConfig, ServerConfig};
use crate::mcp_pool::PoolConfig;

#[derive(Debug, Serialize)]
struct ServerReport {
    name: String,
    transport: &'static str,
    pooled: bool,
}

/// Execute the check-config command
pub fn execute(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let problems: Vec<String> = config.validate().iter().map(ToString::to_string).collect();
    let servers = server_reports(&config);

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "path": config_path.display().to_string(),
                "platform_supported": PoolConfig::is_platform_supported(),
                "servers": servers,
                "problems": problems,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("Config: {}", config_path.display());
            if !PoolConfig::is_platform_supported() {
                println!("Socket pooling is not supported on this platform");
            }
            for server in &servers {
                let pooled = if server.pooled { "pooled" } else { "not pooled" };
                println!("  {:<24} {:<6} {pooled}", server.name, server.transport);
            }
            for problem in &problems {
                println!("error: {problem}");
            }
        }
    }

    if !problems.is_empty() {
        bail!("{} problem(s) found", problems.len());
    }
    Ok(())
}

fn server_reports(config: &AppConfig) -> Vec<ServerReport> {
    config
        .servers
        .iter()
        .map(|(name, server)| match server {
            ServerConfig::Stdio { .. } => ServerReport {
                name: name.clone(),
                transport: "stdio",
                pooled: config.pool.should_pool(name),
            },
            // HTTP servers are always managed; pooling policy covers sockets only
            ServerConfig::Http { .. } => ServerReport {
                name: name.clone(),
                transport: "http",
                pooled: true,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_reports_apply_policy() {
        let mut config = AppConfig::default();
        config.pool.exclude_mcps = vec!["skip".to_string()];
        for name in ["keep", "skip"] {
            config.servers.insert(
                name.to_string(),
                ServerConfig::Stdio {
                    command: "cat".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                },
            );
        }

        let reports = server_reports(&config);
        let pooled: Vec<_> = reports.iter().map(|r| (r.name.as_str(), r.pooled)).collect();
        assert_eq!(pooled, vec![("keep", true), ("skip", false)]);
    }
}
