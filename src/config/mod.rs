// ABOUTME: Application configuration for mcpool
// Pool tunables plus the MCP server definitions the pools are initialized from

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::mcp_pool::{HttpServerSpec, LaunchSpec, PoolConfig};

/// Problems found by [`AppConfig::validate`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A stdio server without a command
    #[error("server '{0}': command is empty")]
    EmptyCommand(String),

    /// An HTTP server URL that does not parse
    #[error("server '{name}': invalid {field} '{value}'")]
    InvalidUrl {
        /// Server name
        name: String,
        /// `url` or `health_url`
        field: &'static str,
        /// The rejected text
        value: String,
    },

    /// Server names end up in socket file names
    #[error("server name '{0}' may only contain letters, digits, '-', '_' and '.', and may not start with '.'")]
    InvalidName(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pool tunables and admission policy
    #[serde(default)]
    pub pool: PoolConfig,

    /// MCP servers by name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// How an MCP server is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerConfig {
    /// JSON-RPC over the server's stdin/stdout, shared through a socket proxy
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// The server listens on its own HTTP endpoint
    Http {
        url: String,
        #[serde(default)]
        health_url: Option<String>,
        /// Launched only when `url` is not already reachable
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default = "default_startup_timeout_secs")]
        startup_timeout_secs: u64,
    },
}

fn default_startup_timeout_secs() -> u64 {
    5
}

impl ServerConfig {
    /// Launch spec of a stdio server
    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        match self {
            Self::Stdio { command, args, env } => {
                Some(LaunchSpec::new(command.clone(), args.clone(), env.clone()))
            }
            Self::Http { .. } => None,
        }
    }

    /// Spec of an HTTP server
    pub fn http_spec(&self) -> Option<HttpServerSpec> {
        match self {
            Self::Stdio { .. } => None,
            Self::Http {
                url,
                health_url,
                command,
                args,
                env,
                startup_timeout_secs,
            } => Some(HttpServerSpec {
                url: url.clone(),
                health_url: health_url.clone(),
                launch: command.as_ref().map_or_else(LaunchSpec::default, |command| {
                    LaunchSpec::new(command.clone(), args.clone(), env.clone())
                }),
                startup_timeout: Duration::from_secs(*startup_timeout_secs),
            }),
        }
    }
}

impl AppConfig {
    /// Default config location, `~/.mcpool/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcpool")
            .join("config.toml")
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Write the config to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Every problem in the server definitions
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();

        for (name, server) in &self.servers {
            if !PoolConfig::is_valid_server_name(name) {
                problems.push(ConfigError::InvalidName(name.clone()));
            }

            match server {
                ServerConfig::Stdio { command, .. } => {
                    if command.trim().is_empty() {
                        problems.push(ConfigError::EmptyCommand(name.clone()));
                    }
                }
                ServerConfig::Http { url, health_url, .. } => {
                    let fields = std::iter::once(("url", url))
                        .chain(health_url.iter().map(|h| ("health_url", h)));
                    for (field, value) in fields {
                        if ::url::Url::parse(value).is_err() {
                            problems.push(ConfigError::InvalidUrl {
                                name: name.clone(),
                                field,
                                value: value.clone(),
                            });
                        }
                    }
                }
            }
        }

        problems
    }

    /// Stdio servers with their launch specs
    pub fn stdio_servers(&self) -> BTreeMap<String, LaunchSpec> {
        self.servers
            .iter()
            .filter_map(|(name, server)| server.launch_spec().map(|spec| (name.clone(), spec)))
            .collect()
    }

    /// HTTP servers with their specs
    pub fn http_servers(&self) -> BTreeMap<String, HttpServerSpec> {
        self.servers
            .iter()
            .filter_map(|(name, server)| server.http_spec().map(|spec| (name.clone(), spec)))
            .collect()
    }
}
