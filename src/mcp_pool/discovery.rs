// ABOUTME: Socket liveness checks and discovery of sockets owned by other instances
//
// Every instance derives socket paths the same way ({prefix}{name}.sock in the
// socket directory), so a socket left by another running instance can be
// found and shared. A socket file is only trusted if a connect() to it
// succeeds within a short timeout; files that fail the dial are leftovers from
// a crashed instance and get removed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::config::PoolConfig;

/// Errors that can occur during discovery
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Socket directory access failed
    #[error("Failed to access socket directory: {0}")]
    SocketDirAccessFailed(#[source] io::Error),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Information about a discovered socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredSocket {
    /// MCP server name extracted from socket filename
    pub mcp_name: String,

    /// Path to the socket file
    pub socket_path: PathBuf,

    /// Whether a connect() succeeded
    pub is_alive: bool,
}

/// Dial `path` and report whether something is accepting connections
///
/// A missing file, a refused connection or a timeout all count as dead.
pub async fn is_socket_alive(path: &Path, timeout: Duration) -> bool {
    if !path.exists() {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// Remove a socket file, ignoring a file that is already gone
///
/// Failures are logged and otherwise ignored.
pub fn remove_socket_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            false
        }
    }
}

/// Finds pooled sockets in the socket directory
#[derive(Debug, Clone)]
pub struct SocketDiscovery {
    /// Pool configuration
    config: PoolConfig,
}

impl SocketDiscovery {
    /// Create a new socket discovery instance
    #[must_use]
    pub const fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Socket files following our naming convention, without dialing them
    pub fn scan(&self) -> DiscoveryResult<Vec<(String, PathBuf)>> {
        let socket_dir = self.config.socket_dir();

        let entries = match fs::read_dir(&socket_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DiscoveryError::SocketDirAccessFailed(e)),
        };

        let mut found: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                self.config
                    .mcp_name_from_socket(&path)
                    .map(|name| (name, path))
            })
            .collect();
        found.sort();

        debug!(
            socket_dir = %socket_dir.display(),
            count = found.len(),
            "Scanned socket directory"
        );

        Ok(found)
    }

    /// Every matching socket with its liveness
    pub async fn discover_all(&self) -> DiscoveryResult<Vec<DiscoveredSocket>> {
        let mut sockets = Vec::new();
        for (mcp_name, socket_path) in self.scan()? {
            let is_alive =
                is_socket_alive(&socket_path, self.config.liveness_dial_timeout).await;
            sockets.push(DiscoveredSocket {
                mcp_name,
                socket_path,
                is_alive,
            });
        }
        Ok(sockets)
    }

    /// Live sockets, skipping names in `known`; dead ones are removed from disk
    pub async fn discover_live<F>(&self, known: F) -> DiscoveryResult<Vec<DiscoveredSocket>>
    where
        F: Fn(&str) -> bool,
    {
        let mut live = Vec::new();
        let mut removed = 0usize;

        for (mcp_name, socket_path) in self.scan()? {
            if known(&mcp_name) {
                continue;
            }

            if is_socket_alive(&socket_path, self.config.liveness_dial_timeout).await {
                live.push(DiscoveredSocket {
                    mcp_name,
                    socket_path,
                    is_alive: true,
                });
            } else {
                debug!(mcp = %mcp_name, path = %socket_path.display(), "Removing stale socket");
                if remove_socket_file(&socket_path) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(count = removed, "Cleaned up stale sockets");
        }

        Ok(live)
    }
}
