// ABOUTME: Lifecycle wrapper for an MCP server that serves its own HTTP endpoint
//
// Clients talk to the server's port directly, so there is nothing to proxy.
// The wrapper probes reachability, spawns the server when nothing answers,
// waits for it to come up, and watches for it to die. A server that already
// answers at its health URL is adopted as external and never signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::process_supervisor::{
    LaunchSpec, ProcessExit, SpawnOptions, SupervisedProcess, SupervisorError,
};
use super::socket_proxy::ProxyContext;
use super::status::{ServerStatus, StatusCell};

/// Timeout of a single reachability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between probes while waiting for startup
pub const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Startup timeout used when none is configured
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while managing an HTTP server
#[derive(Debug, Error)]
pub enum HttpServerError {
    /// A configured URL does not parse
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected text
        url: String,
        /// Parse failure
        #[source]
        source: url::ParseError,
    },

    /// The probe client could not be built
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Nothing answers and nothing can be started
    #[error("HTTP MCP {0}: URL not reachable and no server command configured")]
    NoCommand(String),

    /// Process management error
    #[error("Process error: {0}")]
    Spawn(#[from] SupervisorError),

    /// The process died before the URL became reachable
    #[error("HTTP server {name} exited before becoming ready ({exit})")]
    ExitedDuringStartup {
        /// Server name
        name: String,
        /// How it ended
        exit: ProcessExit,
    },

    /// The URL never became reachable
    #[error("HTTP server {name} not ready after {timeout:?}")]
    StartupTimeout {
        /// Server name
        name: String,
        /// Configured startup timeout
        timeout: Duration,
    },

    /// Startup was interrupted by stop or shutdown
    #[error("HTTP server {0} startup cancelled")]
    Cancelled(String),

    /// Health probe failed
    #[error("Server not responding at {0}")]
    Unreachable(String),

    /// A start is already in progress
    #[error("HTTP server {0} is already starting")]
    AlreadyStarting(String),

    /// The server is fenced
    #[error("HTTP server {0} is permanently failed")]
    PermanentlyFailed(String),

    /// The name cannot be used in a log file name
    #[error("Invalid HTTP server name '{0}'")]
    InvalidName(String),

    /// No server registered under this name
    #[error("HTTP server {0} not found")]
    NotFound(String),

    /// The owning pool has been shut down
    #[error("HTTP pool is shut down")]
    ShutDown,
}

/// Everything needed to reach, and optionally launch, an HTTP MCP server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServerSpec {
    /// Endpoint clients connect to
    pub url: String,

    /// Probe URL; `url` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    /// How to launch the server; empty when it is managed elsewhere
    #[serde(flatten)]
    pub launch: LaunchSpec,

    /// How long to wait for the URL after spawning
    #[serde(default = "default_startup_timeout", with = "super::config::duration_secs")]
    pub startup_timeout: Duration,
}

const fn default_startup_timeout() -> Duration {
    DEFAULT_STARTUP_TIMEOUT
}

impl HttpServerSpec {
    /// Spec for a server that is only probed, never launched
    pub fn external(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            ..Self::default()
        }
    }
}

fn parse_url(text: &str) -> Result<Url, HttpServerError> {
    Url::parse(text).map_err(|source| HttpServerError::InvalidUrl {
        url: text.to_string(),
        source,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Managed HTTP MCP server
#[derive(Debug)]
pub struct HttpServer {
    name: String,
    url: Url,
    health_url: Url,
    launch: LaunchSpec,
    startup_timeout: Duration,

    client: reqwest::Client,
    ctx: ProxyContext,

    /// Pool token; each start derives a fresh child from it
    parent: CancellationToken,
    cancel: Mutex<CancellationToken>,

    process: Mutex<Option<SupervisedProcess>>,
    exit_monitor: Mutex<Option<JoinHandle<()>>>,

    status: Arc<StatusCell>,
    started_by_us: AtomicBool,
    last_error: Arc<Mutex<Option<String>>>,
}

impl HttpServer {
    /// Create a stopped server
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` for unparsable URLs and `Client` if the probe
    /// client cannot be built.
    pub fn new(
        name: impl Into<String>,
        spec: HttpServerSpec,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Result<Self, HttpServerError> {
        Self::build(name.into(), spec, ServerStatus::Stopped, ctx, parent)
    }

    /// Create an entry for a server someone else runs
    ///
    /// It is `Running` straight away; its reachability is not checked.
    pub fn external(
        name: impl Into<String>,
        url: &str,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Result<Self, HttpServerError> {
        Self::build(
            name.into(),
            HttpServerSpec::external(url),
            ServerStatus::Running,
            ctx,
            parent,
        )
    }

    fn build(
        name: String,
        spec: HttpServerSpec,
        initial: ServerStatus,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Result<Self, HttpServerError> {
        let url = parse_url(&spec.url)?;
        let health_url = match spec.health_url.as_deref() {
            Some(text) if !text.trim().is_empty() => parse_url(text)?,
            _ => url.clone(),
        };
        let startup_timeout = if spec.startup_timeout.is_zero() {
            DEFAULT_STARTUP_TIMEOUT
        } else {
            spec.startup_timeout
        };
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        Ok(Self {
            name,
            url,
            health_url,
            launch: spec.launch,
            startup_timeout,
            client,
            ctx: ctx.clone(),
            parent: parent.clone(),
            cancel: Mutex::new(parent.child_token()),
            process: Mutex::new(None),
            exit_monitor: Mutex::new(None),
            status: Arc::new(StatusCell::new(initial)),
            started_by_us: AtomicBool::new(false),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint clients connect to
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// URL probed for reachability
    pub fn health_url(&self) -> &str {
        self.health_url.as_str()
    }

    /// Current lifecycle state
    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    /// Whether the status is `Running`
    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    /// Whether this instance spawned the server
    pub fn started_by_us(&self) -> bool {
        self.started_by_us.load(Ordering::SeqCst)
    }

    /// Last startup or crash error
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// OS pid of the owned process
    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(SupervisedProcess::pid)
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }

    fn mark_start_failed(&self) {
        if let Err(e) = self.status.transition(ServerStatus::Failed) {
            debug!(mcp = %self.name, reason = %e, "Start failure after stop");
        }
    }

    /// A token for the next process; replaced once the previous one was cancelled
    fn live_token(&self) -> Option<CancellationToken> {
        if self.parent.is_cancelled() {
            return None;
        }
        let mut token = lock(&self.cancel);
        if token.is_cancelled() {
            *token = self.parent.child_token();
        }
        Some(token.clone())
    }

    /// Whether the health URL answers with a status below 500
    pub async fn is_reachable(&self) -> bool {
        match self.client.get(self.health_url.clone()).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                debug!(mcp = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Probe once
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the health URL does not answer.
    pub async fn health_check(&self) -> Result<(), HttpServerError> {
        if self.is_reachable().await {
            Ok(())
        } else {
            Err(HttpServerError::Unreachable(self.health_url.to_string()))
        }
    }

    /// Start the server, or adopt one that already answers
    ///
    /// # Errors
    ///
    /// Returns `NoCommand` when nothing answers and there is nothing to
    /// launch; spawn, early-exit and timeout failures leave the server
    /// `Failed` with `last_error` set.
    pub async fn start(&self) -> Result<(), HttpServerError> {
        match self.status() {
            ServerStatus::Running => return Ok(()),
            ServerStatus::PermanentlyFailed => {
                return Err(HttpServerError::PermanentlyFailed(self.name.clone()))
            }
            ServerStatus::Starting => return Err(HttpServerError::AlreadyStarting(self.name.clone())),
            ServerStatus::Stopped | ServerStatus::Failed => {}
        }

        if self.is_reachable().await {
            if self.status.transition(ServerStatus::Running).is_ok() {
                self.started_by_us.store(false, Ordering::SeqCst);
                info!(mcp = %self.name, url = %self.url, "External HTTP server detected");
            }
            return Ok(());
        }

        if self.launch.is_empty() {
            return Err(HttpServerError::NoCommand(self.name.clone()));
        }

        let Some(cancel) = self.live_token() else {
            return Err(HttpServerError::Cancelled(self.name.clone()));
        };
        if self.status.transition(ServerStatus::Starting).is_err() {
            return Err(HttpServerError::AlreadyStarting(self.name.clone()));
        }

        let options = SpawnOptions {
            own_process_group: false,
            pipe_stdio: false,
            log_file: Some(self.ctx.config.http_log_path(&self.name)),
            term_grace: self.ctx.config.term_grace,
        };
        let spawned = match self.ctx.supervisor.spawn(&self.launch, &options, cancel.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(mcp = %self.name, error = %e, "Failed to start HTTP server");
                self.record_error(e.to_string());
                self.mark_start_failed();
                return Err(e.into());
            }
        };

        let pid = spawned.process.pid();
        info!(mcp = %self.name, pid = pid, "HTTP server process started");

        let exit_rx = spawned.process.exit_watch();
        let monitor = tokio::spawn(monitor_exit(
            self.name.clone(),
            exit_rx.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.last_error),
        ));
        *lock(&self.process) = Some(spawned.process);
        if let Some(previous) = lock(&self.exit_monitor).replace(monitor) {
            previous.abort();
        }

        if let Err(e) = self.wait_ready(exit_rx, &cancel).await {
            warn!(mcp = %self.name, error = %e, "HTTP server failed to become ready");
            self.record_error(e.to_string());
            self.mark_start_failed();
            cancel.cancel();
            return Err(e);
        }

        if !self
            .status
            .transition_from(ServerStatus::Starting, ServerStatus::Running)
        {
            return Err(HttpServerError::Cancelled(self.name.clone()));
        }
        self.started_by_us.store(true, Ordering::SeqCst);
        info!(mcp = %self.name, url = %self.url, "HTTP server ready");
        Ok(())
    }

    async fn wait_ready(
        &self,
        exit_rx: watch::Receiver<Option<ProcessExit>>,
        cancel: &CancellationToken,
    ) -> Result<(), HttpServerError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;

        while tokio::time::Instant::now() < deadline {
            if let Some(exit) = exit_rx.borrow().clone() {
                return Err(HttpServerError::ExitedDuringStartup {
                    name: self.name.clone(),
                    exit,
                });
            }

            if self.is_reachable().await {
                return Ok(());
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(HttpServerError::Cancelled(self.name.clone()));
                }
                () = tokio::time::sleep(STARTUP_POLL_INTERVAL) => {}
            }
        }

        Err(HttpServerError::StartupTimeout {
            name: self.name.clone(),
            timeout: self.startup_timeout,
        })
    }

    /// Stop the server
    ///
    /// Cancels the process token, which sends the graceful signal to an owned
    /// process, then waits for exit and force-kills on timeout. External
    /// servers are only detached.
    pub async fn stop(&self) {
        if self.status.transition(ServerStatus::Stopped).is_err() {
            debug!(mcp = %self.name, "Stopping permanently failed HTTP server");
        }
        lock(&self.cancel).cancel();

        let process = lock(&self.process).take();
        match process {
            Some(process) => {
                if let Some(exit) = process
                    .await_exit_or_kill(self.ctx.config.stop_grace)
                    .await
                {
                    debug!(mcp = %self.name, %exit, "HTTP server process exited");
                }
                info!(mcp = %self.name, "HTTP server process stopped");
            }
            None if !self.started_by_us() => {
                info!(mcp = %self.name, "External HTTP server disconnected");
            }
            None => {}
        }

        let monitor = lock(&self.exit_monitor).take();
        if let Some(monitor) = monitor {
            if tokio::time::timeout(Duration::from_secs(1), monitor).await.is_err() {
                debug!(mcp = %self.name, "Exit monitor did not finish in time");
            }
        }
    }

    /// Stop, then start again on a fresh token
    ///
    /// # Errors
    ///
    /// Returns the start error.
    pub async fn restart(&self) -> Result<(), HttpServerError> {
        self.stop().await;
        self.start().await
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        lock(&self.cancel).cancel();
    }
}

/// Mark the server failed if its process dies while it is `Running`
async fn monitor_exit(
    name: String,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    status: Arc<StatusCell>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let mut exit_rx = exit_rx;
    // The wait_for guard borrows the receiver, so it is released before the fallback
    let waited = exit_rx.wait_for(Option::is_some).await.map(|exit| exit.clone());
    let exit = match waited {
        Ok(exit) => exit,
        Err(_) => exit_rx.borrow().clone(),
    };
    let Some(exit) = exit else {
        return;
    };

    if exit.is_success() {
        info!(mcp = %name, "HTTP server process exited");
    } else {
        warn!(mcp = %name, %exit, "HTTP server process exited with error");
    }

    // A deliberate stop has already moved the status away from Running
    if status.transition_from(ServerStatus::Running, ServerStatus::Failed) {
        *lock(&last_error) = Some(exit.to_string());
        warn!(mcp = %name, "HTTP server crashed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp_pool::config::PoolConfig;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP responder answering every request with `status`
    pub(crate) async fn serve_status(listener: TcpListener, status: u16) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }

    pub(crate) async fn responder(status: u16) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (addr, tokio::spawn(serve_status(listener, status)))
    }

    /// An address nothing listens on
    pub(crate) async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    pub(crate) fn test_ctx(dir: &TempDir) -> ProxyContext {
        ProxyContext::new(PoolConfig {
            log_dir: Some(dir.path().join("logs")),
            stop_grace: Duration::from_secs(2),
            term_grace: Duration::from_secs(1),
            ..PoolConfig::default()
        })
    }

    fn spec(addr: SocketAddr, script: Option<&str>, timeout: Duration) -> HttpServerSpec {
        HttpServerSpec {
            url: format!("http://{addr}/mcp"),
            health_url: None,
            launch: script.map_or_else(LaunchSpec::default, |s| {
                LaunchSpec::new("sh", vec!["-c".to_string(), s.to_string()], HashMap::new())
            }),
            startup_timeout: timeout,
        }
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_invalid_url_rejected() {
        let dir = TempDir::new().unwrap();
        let result = HttpServer::new(
            "bad",
            HttpServerSpec::external("not a url"),
            &test_ctx(&dir),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(HttpServerError::InvalidUrl { .. })));
    }

    #[test]
    fn test_health_url_defaults_to_url() {
        let dir = TempDir::new().unwrap();
        let server = HttpServer::new(
            "srv",
            HttpServerSpec::external("http://127.0.0.1:9/mcp"),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(server.health_url(), server.url());
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[test]
    fn test_spec_from_toml_defaults() {
        let spec: HttpServerSpec = toml::from_str(
            r#"
            url = "http://localhost:8080/mcp"
            command = "my-server"
            args = ["--port", "8080"]
            "#,
        )
        .unwrap();
        assert_eq!(spec.launch.command, "my-server");
        assert_eq!(spec.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
        assert_eq!(spec.health_url, None);
    }

    // ==================== Reachability Tests ====================

    #[tokio::test]
    async fn test_reachability_status_threshold() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let root = CancellationToken::new();

        for (status, reachable) in [(200, true), (401, true), (404, true), (500, false), (503, false)] {
            let (addr, handle) = responder(status).await;
            let server =
                HttpServer::new("health", spec(addr, None, DEFAULT_STARTUP_TIMEOUT), &ctx, &root)
                    .unwrap();
            assert_eq!(server.is_reachable().await, reachable, "status {status}");
            handle.abort();
        }
    }

    // ==================== Start Tests ====================

    #[tokio::test]
    async fn test_reachable_server_adopted_as_external() {
        let dir = TempDir::new().unwrap();
        let (addr, handle) = responder(200).await;
        let server = HttpServer::new(
            "ext",
            spec(addr, Some("sleep 30"), DEFAULT_STARTUP_TIMEOUT),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        server.start().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert!(!server.started_by_us());
        assert!(server.pid().is_none());

        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
        handle.abort();
    }

    #[tokio::test]
    async fn test_unreachable_without_command() {
        let dir = TempDir::new().unwrap();
        let server = HttpServer::new(
            "nocmd",
            spec(closed_addr().await, None, DEFAULT_STARTUP_TIMEOUT),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(matches!(
            server.start().await,
            Err(HttpServerError::NoCommand(_))
        ));
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_spawned_server_becomes_ready() {
        let dir = TempDir::new().unwrap();
        let listener_addr = closed_addr().await;
        let server = HttpServer::new(
            "spawned",
            spec(listener_addr, Some("sleep 30"), Duration::from_secs(5)),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        // The endpoint comes up shortly after the process is spawned
        let bring_up = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(listener_addr).await.unwrap();
            serve_status(listener, 200).await;
        });

        server.start().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert!(server.started_by_us());
        assert!(server.pid().is_some());

        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.pid().is_none());
        bring_up.abort();
    }

    #[tokio::test]
    async fn test_exit_during_startup_fails() {
        let dir = TempDir::new().unwrap();
        let server = HttpServer::new(
            "dies",
            spec(closed_addr().await, Some("echo boom >&2; exit 3"), Duration::from_secs(5)),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, HttpServerError::ExitedDuringStartup { .. }));
        assert_eq!(server.status(), ServerStatus::Failed);
        assert!(server.last_error().unwrap().contains("exit status 3"));

        let log = std::fs::read_to_string(dir.path().join("logs/http-servers/dies.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn test_startup_timeout_fails() {
        let dir = TempDir::new().unwrap();
        let server = HttpServer::new(
            "slow",
            spec(closed_addr().await, Some("sleep 30"), Duration::from_millis(400)),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, HttpServerError::StartupTimeout { .. }));
        assert_eq!(server.status(), ServerStatus::Failed);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_crash_after_ready_marks_failed() {
        let dir = TempDir::new().unwrap();
        let (addr, handle) = responder(200).await;
        let server = HttpServer::new(
            "crashy",
            spec(addr, Some("sleep 30"), Duration::from_secs(5)),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();

        // Force the spawn path even though the endpoint answers
        let _ = server.status.transition(ServerStatus::Starting);
        let options = SpawnOptions {
            own_process_group: false,
            pipe_stdio: false,
            log_file: None,
            term_grace: Duration::from_millis(200),
        };
        let spawned = server
            .ctx
            .supervisor
            .spawn(
                &LaunchSpec::new("sh", vec!["-c".to_string(), "sleep 0.3; exit 7".to_string()], HashMap::new()),
                &options,
                CancellationToken::new(),
            )
            .unwrap();
        let monitor = tokio::spawn(monitor_exit(
            server.name.clone(),
            spawned.process.exit_watch(),
            Arc::clone(&server.status),
            Arc::clone(&server.last_error),
        ));
        assert!(server
            .status
            .transition_from(ServerStatus::Starting, ServerStatus::Running));

        monitor.await.unwrap();
        assert_eq!(server.status(), ServerStatus::Failed);
        assert_eq!(server.last_error().as_deref(), Some("exit status 7"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_exit_recorded_before_monitor_starts() {
        let status = Arc::new(StatusCell::new(ServerStatus::Running));
        let last_error = Arc::new(Mutex::new(None));
        let (exit_tx, exit_rx) = watch::channel(Some(ProcessExit::Exited { code: 5 }));
        drop(exit_tx);

        monitor_exit("gone".to_string(), exit_rx, Arc::clone(&status), Arc::clone(&last_error))
            .await;
        assert_eq!(status.get(), ServerStatus::Failed);
        assert_eq!(lock(&last_error).as_deref(), Some("exit status 5"));
    }

    #[tokio::test]
    async fn test_monitor_ends_quietly_when_watch_closes_without_exit() {
        let status = Arc::new(StatusCell::new(ServerStatus::Running));
        let last_error = Arc::new(Mutex::new(None));
        let (exit_tx, exit_rx) = watch::channel(None);

        let monitor = tokio::spawn(monitor_exit(
            "orphan".to_string(),
            exit_rx,
            Arc::clone(&status),
            Arc::clone(&last_error),
        ));
        drop(exit_tx);

        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.get(), ServerStatus::Running);
        assert_eq!(*lock(&last_error), None);
    }

    #[tokio::test]
    async fn test_stop_does_not_report_crash() {
        let dir = TempDir::new().unwrap();
        let listener_addr = closed_addr().await;
        let server = HttpServer::new(
            "clean",
            spec(listener_addr, Some("sleep 30"), Duration::from_secs(5)),
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();
        let bring_up = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(listener_addr).await.unwrap();
            serve_status(listener, 200).await;
        });

        server.start().await.unwrap();
        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert_eq!(server.last_error(), None);

        // Restart on a fresh token
        server.restart().await.unwrap();
        assert!(server.is_running());
        server.stop().await;
        bring_up.abort();
    }

    #[tokio::test]
    async fn test_external_constructor_is_running() {
        let dir = TempDir::new().unwrap();
        let server = HttpServer::external(
            "remote",
            "http://127.0.0.1:9/mcp",
            &test_ctx(&dir),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(server.is_running());
        assert!(!server.started_by_us());
        assert!(server.health_check().await.is_err());
    }
}
