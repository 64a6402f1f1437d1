// ABOUTME: Named collection of HTTP MCP servers
// ABOUTME: Start-or-reuse by name, external registration, crash restarts and owned-only shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::health::HealthMonitor;
use super::http_server::{HttpServer, HttpServerError, HttpServerSpec};
use super::socket_proxy::ProxyContext;
use super::status::ServerStatus;

/// Information about a managed HTTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpServerInfo {
    /// Server name
    pub name: String,
    /// Endpoint clients connect to
    pub url: String,
    /// Current lifecycle state
    pub status: ServerStatus,
    /// False for servers someone else runs
    pub started_by_us: bool,
}

/// Pool of HTTP MCP servers
///
/// Unlike the socket pool there is no discovery and no restart fencing:
/// reachability of the URL is the only "already running" check, and crashed
/// servers are restarted on every health tick. Start, stop and restart of one
/// name are serialized by a per-name lock, so a second `start` waits for the
/// first and then reuses its entry.
#[derive(Debug)]
pub struct HttpPool {
    ctx: ProxyContext,
    servers: RwLock<HashMap<String, Arc<HttpServer>>>,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancellationToken,
    monitor: Mutex<Option<HealthMonitor>>,
    shut_down: AtomicBool,
}

impl HttpPool {
    /// Create an empty pool whose token derives from `parent`
    pub fn new(ctx: ProxyContext, parent: &CancellationToken) -> Self {
        Self {
            ctx,
            servers: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
            cancel: parent.child_token(),
            monitor: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.ctx.config
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<HttpServer>>> {
        self.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<HttpServer>>> {
        self.servers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server registered under `name`
    pub fn get(&self, name: &str) -> Option<Arc<HttpServer>> {
        self.read_map().get(name).cloned()
    }

    /// Take the lifecycle lock of `name`
    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn snapshot(&self) -> Vec<Arc<HttpServer>> {
        let mut servers: Vec<_> = self.read_map().values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    /// Start `name`, or reuse the registered entry
    ///
    /// A new entry stays registered even if its start fails, so a later
    /// `start` retries the same server. A concurrent call for the same name
    /// waits for the one in progress.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` or `InvalidUrl` for a bad name or spec,
    /// `ShutDown` after shutdown, and otherwise whatever the server's start
    /// returns.
    pub async fn start(&self, name: &str, spec: HttpServerSpec) -> Result<(), HttpServerError> {
        if !PoolConfig::is_valid_server_name(name) {
            return Err(HttpServerError::InvalidName(name.to_string()));
        }
        let _guard = self.lock_name(name).await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(HttpServerError::ShutDown);
        }

        let server = {
            let mut map = self.write_map();
            if let Some(existing) = map.get(name) {
                Arc::clone(existing)
            } else {
                let server = Arc::new(HttpServer::new(name, spec, &self.ctx, &self.cancel)?);
                map.insert(name.to_string(), Arc::clone(&server));
                server
            }
        };

        if server.is_running() {
            debug!(mcp = %name, "HTTP server already running");
            return Ok(());
        }
        server.start().await
    }

    /// Stop `name`; the entry stays registered as `Stopped`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry exists.
    pub async fn stop(&self, name: &str) -> Result<(), HttpServerError> {
        let _guard = self.lock_name(name).await;
        let server = self
            .get(name)
            .ok_or_else(|| HttpServerError::NotFound(name.to_string()))?;
        server.stop().await;
        Ok(())
    }

    /// Stop `name` only if this pool spawned it
    ///
    /// Returns whether a stop happened. Unknown names are ignored.
    pub async fn stop_if_started_by_us(&self, name: &str) -> bool {
        let _guard = self.lock_name(name).await;
        let Some(server) = self.get(name) else {
            return false;
        };
        if !server.started_by_us() {
            info!(mcp = %name, "Skipping stop of external HTTP server");
            return false;
        }
        server.stop().await;
        true
    }

    /// Whether `name` is registered and `Running`
    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).is_some_and(|server| server.is_running())
    }

    /// Endpoint URL for `name`
    pub fn url(&self, name: &str) -> Option<String> {
        self.get(name).map(|server| server.url().to_string())
    }

    /// Entries sorted by name
    pub fn list(&self) -> Vec<HttpServerInfo> {
        self.snapshot()
            .into_iter()
            .map(|server| HttpServerInfo {
                name: server.name().to_string(),
                url: server.url().to_string(),
                status: server.status(),
                started_by_us: server.started_by_us(),
            })
            .collect()
    }

    /// Number of `Running` entries
    pub fn running_count(&self) -> usize {
        self.read_map().values().filter(|s| s.is_running()).count()
    }

    /// Record a server someone else runs, without probing it
    ///
    /// Returns false if `name` is already registered.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` or `InvalidUrl` if either is unusable.
    pub fn register_external(&self, name: &str, url: &str) -> Result<bool, HttpServerError> {
        if !PoolConfig::is_valid_server_name(name) {
            return Err(HttpServerError::InvalidName(name.to_string()));
        }
        let mut map = self.write_map();
        if map.contains_key(name) {
            return Ok(false);
        }
        let server = HttpServer::external(name, url, &self.ctx, &self.cancel)?;
        map.insert(name.to_string(), Arc::new(server));
        info!(mcp = %name, url = %url, "External HTTP server registered");
        Ok(true)
    }

    /// Restart every owned server that crashed; returns the restarted names
    pub async fn check_health(&self) -> Vec<String> {
        let failed: Vec<Arc<HttpServer>> = self
            .snapshot()
            .into_iter()
            .filter(|s| s.started_by_us() && s.status() == ServerStatus::Failed)
            .collect();

        let mut restarted = Vec::new();
        for server in failed {
            let _guard = self.lock_name(server.name()).await;
            // Someone else may have stopped or restarted it meanwhile
            if server.status() != ServerStatus::Failed {
                continue;
            }
            info!(mcp = %server.name(), "Restarting failed HTTP server");
            match server.restart().await {
                Ok(()) => {
                    info!(mcp = %server.name(), "HTTP server restarted");
                    restarted.push(server.name().to_string());
                }
                Err(e) => error!(mcp = %server.name(), error = %e, "HTTP server restart failed"),
            }
        }
        restarted
    }

    /// Start the periodic health monitor; a no-op if it is already running
    pub fn start_health_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(HealthMonitor::is_running) {
            return;
        }

        let pool = Arc::downgrade(self);
        *slot = Some(HealthMonitor::spawn(
            "http_pool",
            self.ctx.config.http_health_check_interval,
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

    /// Cancel the pool and stop every server it spawned
    ///
    /// External servers are left running. Idempotent; bounded by
    /// `shutdown_timeout`.
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

        // Starts in flight see the cancelled token and give up
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
        let servers: Vec<Arc<HttpServer>> =
            self.write_map().drain().map(|(_, server)| server).collect();
        let owned: Vec<_> = servers.iter().filter(|s| s.started_by_us()).collect();

        info!(
            server_count = servers.len(),
            owned = owned.len(),
            "Shutting down HTTP pool"
        );

        let stops = owned.iter().map(|server| async move {
            info!(mcp = %server.name(), "Stopping HTTP server");
            server.stop().await;
        });

        match tokio::time::timeout(self.ctx.config.shutdown_timeout, join_all(stops)).await {
            Ok(_) => info!("All HTTP servers stopped"),
            Err(_) => warn!(
                timeout_secs = self.ctx.config.shutdown_timeout.as_secs(),
                "HTTP pool shutdown timed out"
            ),
        }
        drop(guards);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for HttpPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
