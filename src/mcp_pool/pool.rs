// ABOUTME: MCP socket pool management for sharing MCP servers across sessions
// ABOUTME: Manages named SocketProxy entries with discovery, rate-limited restarts, and graceful shutdown

//! MCP Socket Pool Management
//!
//! The `SocketPool` owns one `SocketProxy` per MCP name and provides:
//! - Admission policy (`should_pool`) and idempotent start
//! - A liveness-checked `is_running` that restarts dead sockets
//! - Rate-limited restarts with permanent-failure fencing
//! - Discovery of sockets served by other instances
//! - Concurrent, bounded shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       SocketPool                          │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │  proxies: RwLock<HashMap<String, Arc<SocketProxy>>> │  │
//! │  │     - context7 -> SocketProxy (running, ours)       │  │
//! │  │     - memory   -> SocketProxy (running, external)   │  │
//! │  │     - exa      -> SocketProxy (permanently failed)  │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │                                                           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌──────────────┐   │
//! │  │SocketDiscovery│  │ HealthMonitor │  │RestartPolicy │   │
//! │  │(find existing)│  │  (periodic)   │  │ (fencing)    │   │
//! │  └───────────────┘  └───────────────┘  └──────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The map lock is never held across an await. Start, restart and stop of
//! one name are serialized by a per-name async lock, so two callers cannot
//! race to replace the same entry while other names proceed independently.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcpool::mcp_pool::{LaunchSpec, PoolConfig, ProxyContext, SocketPool};
//! use tokio_util::sync::CancellationToken;
//!
//! let root = CancellationToken::new();
//! let pool = Arc::new(SocketPool::new(ProxyContext::new(PoolConfig::default()), &root)?);
//!
//! pool.start("context7", LaunchSpec::new("npx", vec!["-y".into(), "@context7/mcp".into()], Default::default())).await?;
//! pool.start_health_monitor();
//!
//! if pool.is_running("context7").await {
//!     let socket = pool.socket_path("context7");
//! }
//!
//! pool.shutdown().await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::discovery::{DiscoveryError, SocketDiscovery};
use super::health::{self, HealthMonitor, HealthReport};
use super::process_supervisor::LaunchSpec;
use super::restart_policy::{RestartDenied, RestartPolicyError, RestartStats};
use super::socket_proxy::{ProxyContext, ProxyError, SocketProxy};
use super::status::ServerStatus;

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from underlying proxy
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Error during socket discovery
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Restart policy values are unusable
    #[error("Invalid restart policy: {0}")]
    InvalidPolicy(#[from] RestartPolicyError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy not found in pool
    #[error("Proxy not found: {0}")]
    NotFound(String),

    /// Entry is fenced and will not be restarted
    #[error("MCP '{0}' is permanently failed")]
    PermanentlyFailed(String),

    /// Restart refused for now
    #[error("Restart of '{name}' rate limited: {reason}")]
    RateLimited {
        /// MCP name
        name: String,
        /// Which limit was hit
        #[source]
        reason: RestartDenied,
    },

    /// Pool has been shut down
    #[error("Pool is shut down")]
    ShutDown,
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Proxy Info ===

/// Information about a managed proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyInfo {
    /// MCP server name
    pub name: String,
    /// Socket path
    pub socket_path: PathBuf,
    /// Current lifecycle state
    pub status: ServerStatus,
    /// Number of connected clients
    pub clients: usize,
    /// False for sockets served by another instance
    pub started_by_us: bool,
}

/// What a caller may do with an MCP name right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Connect to this socket
    Running(PathBuf),
    /// A start is in progress
    Starting,
    /// Down, but the health monitor will retry
    TemporarilyFailed,
    /// Fenced; do not wait for it
    PermanentlyFailed,
    /// Not in the pool
    Absent,
}

// === MCP Socket Pool ===

/// Named collection of socket proxies
///
/// The pool is the only writer of its map. Every proxy's cancellation token
/// is a child of the pool's, so cancelling the pool reaches every owned
/// process.
#[derive(Debug)]
pub struct SocketPool {
    ctx: ProxyContext,

    proxies: RwLock<HashMap<String, Arc<SocketProxy>>>,

    /// Per-name locks serializing start, restart and stop
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    cancel: CancellationToken,

    monitor: Mutex<Option<HealthMonitor>>,

    shut_down: AtomicBool,
}

impl SocketPool {
    /// Create an empty pool whose context derives from `parent`
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the restart policy cannot work.
    pub fn new(ctx: ProxyContext, parent: &CancellationToken) -> PoolResult<Self> {
        ctx.config.restart.validate()?;
        Ok(Self {
            ctx,
            proxies: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
            cancel: parent.child_token(),
            monitor: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.ctx.config
    }

    /// Whether `name` should be served from the pool
    pub fn should_pool(&self, name: &str) -> bool {
        self.ctx.config.should_pool(name)
    }

    /// Whether callers may fall back to a private stdio process
    pub fn fallback_enabled(&self) -> bool {
        self.ctx.config.fallback_enabled()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SocketProxy>>> {
        self.proxies.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SocketProxy>>> {
        self.proxies.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, name: &str) -> Option<Arc<SocketProxy>> {
        self.read_map().get(name).cloned()
    }

    /// Whether an entry exists for `name`, whatever its state
    pub fn contains(&self, name: &str) -> bool {
        self.read_map().contains_key(name)
    }

    /// Take the lifecycle lock of `name`
    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Entries sorted by name, for sweeps that must not hold the map lock
    pub(crate) fn snapshot(&self) -> Vec<(String, Arc<SocketProxy>)> {
        let mut entries: Vec<_> = self
            .read_map()
            .iter()
            .map(|(name, proxy)| (name.clone(), Arc::clone(proxy)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // === Lifecycle ===

    /// Start a proxy for `name` unless one is already registered
    ///
    /// A live socket left by another instance is adopted instead of spawning.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a name that cannot be used in a socket path, and
    /// an error if the pool is shut down or the proxy fails to start. A proxy
    /// that fails to start is not registered.
    pub async fn start(&self, name: &str, spec: LaunchSpec) -> PoolResult<()> {
        if !PoolConfig::is_valid_server_name(name) {
            return Err(PoolError::Config(format!("invalid server name '{name}'")));
        }
        let _guard = self.lock_name(name).await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        if self.contains(name) {
            debug!(mcp = %name, "Proxy already registered");
            return Ok(());
        }

        let proxy = SocketProxy::attach_or_new(name, spec, &self.ctx, &self.cancel).await;
        proxy.start().await?;

        info!(
            mcp = %name,
            socket = %proxy.socket_path().display(),
            started_by_us = proxy.started_by_us(),
            "Proxy registered"
        );
        self.write_map().insert(name.to_string(), Arc::new(proxy));
        Ok(())
    }

    /// Stop and remove the proxy for `name`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry exists.
    pub async fn stop(&self, name: &str) -> PoolResult<()> {
        let _guard = self.lock_name(name).await;
        let proxy = self
            .write_map()
            .remove(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;

        proxy.stop().await;
        info!(mcp = %name, "Proxy stopped and removed");
        Ok(())
    }

    /// Whether `name` is usable right now
    ///
    /// A `Running` entry is double-checked by dialing its socket. If the dial
    /// fails the entry is restarted immediately and the restart's outcome is
    /// reported.
    pub async fn is_running(&self, name: &str) -> bool {
        let Some(proxy) = self.get(name) else {
            return false;
        };

        if proxy.status() != ServerStatus::Running {
            return false;
        }
        if proxy.is_alive().await {
            return true;
        }

        warn!(mcp = %name, socket = %proxy.socket_path().display(), "Socket dead despite running status, restarting");
        match self.restart(name).await {
            Ok(()) => {
                info!(mcp = %name, "Restart after dead socket succeeded");
                true
            }
            Err(e) => {
                error!(mcp = %name, error = %e, "Restart after dead socket failed");
                false
            }
        }
    }

    /// Current status of `name`
    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.get(name).map(|p| p.status())
    }

    /// Routing answer for `name` that separates fenced from retryable entries
    pub fn availability(&self, name: &str) -> Availability {
        let Some(proxy) = self.get(name) else {
            return Availability::Absent;
        };
        match proxy.status() {
            ServerStatus::Running => Availability::Running(proxy.socket_path().to_path_buf()),
            ServerStatus::Starting => Availability::Starting,
            ServerStatus::Failed | ServerStatus::Stopped => Availability::TemporarilyFailed,
            ServerStatus::PermanentlyFailed => Availability::PermanentlyFailed,
        }
    }

    /// Socket path of `name`, whatever its state
    pub fn socket_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|p| p.socket_path().to_path_buf())
    }

    /// Restart bookkeeping of `name`
    pub fn restart_stats(&self, name: &str) -> Option<RestartStats> {
        self.get(name).map(|p| p.restart_stats())
    }

    /// Get information about all managed proxies, sorted by name
    pub fn list(&self) -> Vec<ProxyInfo> {
        self.snapshot()
            .into_iter()
            .map(|(name, proxy)| ProxyInfo {
                name,
                socket_path: proxy.socket_path().to_path_buf(),
                status: proxy.status(),
                clients: proxy.client_count(),
                started_by_us: proxy.started_by_us(),
            })
            .collect()
    }

    /// Number of entries currently `Running`
    pub fn running_count(&self) -> usize {
        self.read_map()
            .values()
            .filter(|p| p.status() == ServerStatus::Running)
            .count()
    }

    // === Restarts ===

    /// Replace `name` with a fresh proxy, bypassing the rate limits
    ///
    /// Fenced entries are still refused.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `PermanentlyFailed`, or the start error.
    pub async fn restart(&self, name: &str) -> PoolResult<()> {
        let _guard = self.lock_name(name).await;
        let old = self
            .get(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        if old.status() == ServerStatus::PermanentlyFailed {
            return Err(PoolError::PermanentlyFailed(name.to_string()));
        }

        let stats = old.restart_stats();
        self.replace(name, &old, &stats, Instant::now()).await
    }

    /// Restart `name` if the restart policy allows it
    ///
    /// An entry at the failure ceiling is fenced into `PermanentlyFailed`. A
    /// rate-limited attempt leaves the entry and its bookkeeping untouched.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited`, `PermanentlyFailed`, `NotFound`, or the start
    /// error of the replacement.
    pub async fn restart_with_rate_limit(&self, name: &str) -> PoolResult<()> {
        let _guard = self.lock_name(name).await;
        let old = self
            .get(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        if old.status() == ServerStatus::PermanentlyFailed {
            return Err(PoolError::PermanentlyFailed(name.to_string()));
        }

        let stats = old.restart_stats();
        let now = Instant::now();
        if let Err(reason) = self.ctx.config.restart.check(&stats, now) {
            if reason.is_permanent() {
                old.mark_permanently_failed();
                error!(
                    mcp = %name,
                    total_failures = stats.total_failures,
                    "Proxy permanently disabled"
                );
                return Err(PoolError::PermanentlyFailed(name.to_string()));
            }
            debug!(mcp = %name, reason = %reason, "Restart rate limited");
            return Err(PoolError::RateLimited {
                name: name.to_string(),
                reason,
            });
        }

        info!(
            mcp = %name,
            total_failures = stats.total_failures,
            max_failures = self.ctx.config.restart.max_total_failures,
            "Auto-restarting proxy"
        );
        self.replace(name, &old, &stats, now).await
    }

    /// Stop `old` and register a freshly built proxy in its place
    ///
    /// The replacement is registered even when it fails to start so the
    /// health monitor can see it; a failure that reaches the ceiling fences
    /// it immediately.
    async fn replace(
        &self,
        name: &str,
        old: &SocketProxy,
        stats: &RestartStats,
        now: Instant,
    ) -> PoolResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        old.stop().await;

        let fresh =
            SocketProxy::attach_or_new(name, old.spec().clone(), &self.ctx, &self.cancel).await;
        let result = fresh.start().await;

        let policy = &self.ctx.config.restart;
        let next = policy.record_attempt(stats, now, result.is_ok());
        if result.is_err() && policy.is_exhausted(&next) {
            fresh.mark_permanently_failed();
            error!(
                mcp = %name,
                total_failures = next.total_failures,
                "Proxy permanently disabled"
            );
        }
        let restart_num = next.restart_count;
        fresh.set_restart_stats(next);

        self.write_map().insert(name.to_string(), Arc::new(fresh));

        match result {
            Ok(()) => {
                info!(mcp = %name, restart_num = restart_num, "Restart complete");
                Ok(())
            }
            Err(e) => {
                warn!(mcp = %name, error = %e, "Restart failed");
                Err(e.into())
            }
        }
    }

    // === Discovery ===

    /// Register an entry for a socket served by another instance
    ///
    /// Returns false if `name` is already registered or is not a valid
    /// server name.
    pub fn register_external(&self, name: &str, socket_path: PathBuf) -> bool {
        if !PoolConfig::is_valid_server_name(name) {
            warn!(mcp = %name, "Ignoring external socket with invalid server name");
            return false;
        }
        let mut map = self.write_map();
        if map.contains_key(name) {
            return false;
        }
        let proxy = SocketProxy::external(name, socket_path, &self.ctx, &self.cancel);
        map.insert(name.to_string(), Arc::new(proxy));
        true
    }

    /// Adopt live sockets of other instances; stale ones are removed
    ///
    /// Returns the number of sockets registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket directory cannot be read.
    pub async fn discover_existing_sockets(&self) -> PoolResult<usize> {
        let discovery = SocketDiscovery::new(PoolConfig::clone(&self.ctx.config));
        let live = discovery.discover_live(|name| self.contains(name)).await?;

        let mut discovered = 0;
        for socket in live {
            if self.register_external(&socket.mcp_name, socket.socket_path.clone()) {
                info!(
                    mcp = %socket.mcp_name,
                    socket = %socket.socket_path.display(),
                    "Discovered external socket"
                );
                discovered += 1;
            }
        }

        if discovered > 0 {
            info!(count = discovered, "Socket discovery complete");
        }
        Ok(discovered)
    }

    /// Discover, start every eligible server, then start the health monitor
    ///
    /// Returns the number of servers running afterwards. Individual start
    /// failures are logged; the health monitor does not retry them since they
    /// were never registered.
    ///
    /// # Errors
    ///
    /// Returns `Config` if pooling is unavailable on this platform.
    pub async fn initialize(
        self: &Arc<Self>,
        servers: &BTreeMap<String, LaunchSpec>,
    ) -> PoolResult<usize> {
        if !PoolConfig::is_platform_supported() {
            return Err(PoolError::Config(
                "Socket pooling not supported on this platform".to_string(),
            ));
        }
        if let Err(e) = std::fs::create_dir_all(self.ctx.config.socket_dir()) {
            return Err(PoolError::Config(format!(
                "Cannot create socket directory: {e}"
            )));
        }

        if let Err(e) = self.discover_existing_sockets().await {
            warn!(error = %e, "Socket discovery failed");
        }

        for (name, spec) in servers {
            if !self.should_pool(name) {
                debug!(mcp = %name, "Not pooled by policy");
                continue;
            }
            if self.is_running(name).await {
                continue;
            }
            if let Err(e) = self.start(name, spec.clone()).await {
                error!(mcp = %name, error = %e, "Failed to start pooled MCP");
            }
        }

        self.start_health_monitor();
        Ok(self.running_count())
    }

    // === Health ===

    /// One health sweep: forgive stable entries, restart failed ones
    pub async fn check_health(&self) -> HealthReport {
        health::sweep_socket_pool(self).await
    }

    /// Start the periodic health monitor; a no-op if it is already running
    pub fn start_health_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(HealthMonitor::is_running) {
            return;
        }

        let pool = Arc::downgrade(self);
        *slot = Some(HealthMonitor::spawn(
            "socket_pool",
            self.ctx.config.health_check_interval,
            self.cancel.child_token(),
            move || {
                let pool = pool.clone();
                async move {
                    if let Some(pool) = pool.upgrade() {
                        pool.check_health().await;
                    }
                }
            },
        ));
    }

    // === Shutdown ===

    /// Cancel the pool and stop every entry concurrently
    ///
    /// Idempotent. Waits at most `shutdown_timeout`; a timeout is logged and
    /// otherwise ignored.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut monitor) = monitor {
            monitor.stop().await;
        }

        // Let in-flight starts and restarts finish registering first. Any of
        // them that passed the shut_down check already holds a lock listed here.
        let locks: Vec<_> = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        let proxies: Vec<(String, Arc<SocketProxy>)> = self.write_map().drain().collect();

        info!(proxy_count = proxies.len(), "Shutting down MCP socket pool");

        let stops = proxies.iter().map(|(name, proxy)| async move {
            debug!(mcp = %name, "Stopping proxy");
            proxy.stop().await;
        });

        match tokio::time::timeout(self.ctx.config.shutdown_timeout, join_all(stops)).await {
            Ok(_) => info!("All proxies stopped"),
            Err(_) => warn!(
                timeout_secs = self.ctx.config.shutdown_timeout.as_secs(),
                "Shutdown timed out"
            ),
        }
        drop(guards);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
