// ABOUTME: Configuration for MCP pooling
//
// Defines PoolConfig with the tunables shared by the socket and HTTP pools:
// - Admission policy (which MCP names get pooled)
// - Socket location and naming
// - Per-server log location
// - Health check, stop and shutdown timings
// - Restart rate limiting (see restart_policy)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::restart_policy::RestartPolicy;

/// Fixed suffix of every pooled socket file
pub const SOCKET_SUFFIX: &str = ".sock";

/// Configuration for the MCP pools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Master switch for pooling
    pub enabled: bool,

    /// Pool every MCP except `exclude_mcps`; when false only `include_mcps` are pooled
    pub pool_all: bool,

    /// MCPs never pooled in pool-all mode
    pub exclude_mcps: Vec<String>,

    /// MCPs pooled in pool-selected mode
    pub include_mcps: Vec<String>,

    /// Callers may fall back to a private stdio process when pooling is unavailable
    pub fallback_to_stdio: bool,

    // === Socket Location ===
    /// Directory for socket files (default: the system temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,

    /// Prefix for socket filenames
    pub socket_prefix: String,

    /// Directory for per-server stderr logs (default: ~/.mcpool/logs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    // === Limits & Timings ===
    /// Maximum concurrent clients per socket proxy
    pub max_clients_per_proxy: usize,

    /// Longest newline-delimited message accepted from a client or an MCP
    pub max_line_bytes: usize,

    /// How long output waits on a client whose queue is full before it is disconnected
    #[serde(with = "duration_secs")]
    pub client_write_timeout: Duration,

    /// Timeout for the liveness dial against a socket
    #[serde(with = "duration_millis")]
    pub liveness_dial_timeout: Duration,

    /// Interval between socket pool health checks
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// Interval between HTTP pool health checks
    #[serde(with = "duration_secs")]
    pub http_health_check_interval: Duration,

    /// How long stop waits for an owned process to exit before force-killing it
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// Delay between the graceful signal and the forced kill after cancellation
    #[serde(with = "duration_secs")]
    pub term_grace: Duration,

    /// Upper bound on a whole pool shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Restart rate limiting and failure fencing
    pub restart: RestartPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_all: true,
            exclude_mcps: vec![],
            include_mcps: vec![],
            fallback_to_stdio: true,

            // Resolved at runtime via socket_dir()/log_dir()
            socket_dir: None,
            socket_prefix: "mcpool-mcp-".to_string(),
            log_dir: None,

            max_clients_per_proxy: 100,
            max_line_bytes: 10 * 1024 * 1024,
            client_write_timeout: Duration::from_secs(10),
            liveness_dial_timeout: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(3),
            http_health_check_interval: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            term_grace: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(10),

            restart: RestartPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Directory holding pooled sockets
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Whether `name` can be embedded in socket and log file names
    ///
    /// ASCII letters, digits, `-`, `_` and `.`, not starting with `.`, so a
    /// name never escapes the socket or log directory.
    pub fn is_valid_server_name(name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    /// Deterministic socket path for an MCP server
    ///
    /// Other instances derive the same path, which is what makes discovery work.
    /// Callers validate `mcp_name` with `is_valid_server_name` first.
    pub fn socket_path(&self, mcp_name: &str) -> PathBuf {
        self.socket_dir()
            .join(format!("{}{mcp_name}{SOCKET_SUFFIX}", self.socket_prefix))
    }

    /// Recover the MCP name from a socket file name, if it follows our convention
    pub fn mcp_name_from_socket(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let name = file_name
            .strip_prefix(&self.socket_prefix)?
            .strip_suffix(SOCKET_SUFFIX)?;
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Root directory for subprocess logs
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mcpool")
                .join("logs")
        })
    }

    /// Stderr log file of a pooled socket server
    pub fn socket_log_path(&self, mcp_name: &str) -> PathBuf {
        self.log_dir()
            .join("mcppool")
            .join(format!("{mcp_name}_socket.log"))
    }

    /// Stderr log file of an HTTP server
    pub fn http_log_path(&self, name: &str) -> PathBuf {
        self.log_dir()
            .join("http-servers")
            .join(format!("{name}.log"))
    }

    /// Check if an MCP should be pooled based on configuration
    pub fn should_pool(&self, mcp_name: &str) -> bool {
        if !self.enabled {
            return false;
        }

        if self.pool_all {
            return !self.exclude_mcps.iter().any(|e| e == mcp_name);
        }

        self.include_mcps.iter().any(|i| i == mcp_name)
    }

    /// Whether callers may fall back to stdio when pooling fails
    pub const fn fallback_enabled(&self) -> bool {
        self.fallback_to_stdio
    }

    /// Check if socket pooling is supported on this platform
    pub fn is_platform_supported() -> bool {
        #[cfg(not(unix))]
        return false;

        #[cfg(unix)]
        {
            // WSL1 does not support Unix sockets well
            if let Ok(version) = std::fs::read_to_string("/proc/version") {
                if version.contains("Microsoft") && !version.contains("WSL2") {
                    return false;
                }
            }
            true
        }
    }
}

/// Serde helper for Duration as seconds (u64)
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
