// ABOUTME: Health monitoring for the MCP pools with configurable check intervals
// ABOUTME: Background task that forgives stable proxies and restarts failed ones

//! Health monitoring for MCP pools.
//!
//! `HealthMonitor` is a periodic background task. Each pool hands it a sweep
//! closure; the socket pool's sweep (`sweep_socket_pool`) does the following
//! on every tick:
//! - Skips external entries (no owned process) and fenced entries
//! - Forgives restart counters of entries running long enough to be trusted
//! - Collects `Failed` entries and restarts them under the rate limits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HealthMonitor                        │
//! │                                                         │
//! │  ┌──────────────┐    ┌──────────────┐                   │
//! │  │ Tick Loop    │───▶│ Pool Sweep   │                   │
//! │  │ (interval)   │    │ (snapshot)   │                   │
//! │  └──────────────┘    └──────────────┘                   │
//! │          │                   │                          │
//! │          │                   ▼                          │
//! │          │           ┌──────────────┐                   │
//! │          │           │ Rate-limited │                   │
//! │          │           │   Restart    │                   │
//! │          │           └──────────────┘                   │
//! │          ▼                                              │
//! │   cancelled with the pool                               │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::{PoolError, SocketPool};
use super::restart_policy::RestartPolicy;
use super::status::ServerStatus;

// === Sweep Report ===

/// What one sweep of the socket pool did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Entries whose counters were reset after a stable run
    pub forgiven: Vec<String>,
    /// Entries restarted successfully
    pub restarted: Vec<String>,
    /// Entries whose restart was refused by the rate limits
    pub rate_limited: Vec<String>,
    /// Entries fenced during this sweep
    pub fenced: Vec<String>,
    /// Entries whose restart was attempted and failed
    pub restart_failed: Vec<String>,
}

impl HealthReport {
    /// Whether the sweep changed nothing
    pub fn is_quiet(&self) -> bool {
        self.forgiven.is_empty()
            && self.restarted.is_empty()
            && self.rate_limited.is_empty()
            && self.fenced.is_empty()
            && self.restart_failed.is_empty()
    }
}

/// One health pass over the socket pool
///
/// The pool map is only read through a snapshot; restarts run without any
/// pool lock held.
pub async fn sweep_socket_pool(pool: &SocketPool) -> HealthReport {
    let policy: &RestartPolicy = &pool.config().restart;
    let now = Instant::now();
    let mut report = HealthReport::default();
    let mut failed = Vec::new();

    for (name, proxy) in pool.snapshot() {
        if !proxy.started_by_us() {
            continue;
        }

        match proxy.status() {
            ServerStatus::Running => {
                let Some(since) = proxy.running_since() else {
                    continue;
                };
                let stats = proxy.restart_stats();
                if policy.is_stable(since, now)
                    && (stats.total_failures > 0 || stats.restart_count > 0)
                {
                    info!(
                        mcp = %name,
                        prev_failures = stats.total_failures,
                        prev_restarts = stats.restart_count,
                        "Failure counters reset"
                    );
                    proxy.set_restart_stats(RestartPolicy::forgive(&stats));
                    report.forgiven.push(name);
                }
            }
            ServerStatus::Failed => failed.push(name),
            ServerStatus::PermanentlyFailed
            | ServerStatus::Starting
            | ServerStatus::Stopped => {}
        }
    }

    for name in failed {
        match pool.restart_with_rate_limit(&name).await {
            Ok(()) => report.restarted.push(name),
            Err(PoolError::RateLimited { reason, .. }) => {
                debug!(mcp = %name, reason = %reason, "Restart deferred");
                report.rate_limited.push(name);
            }
            Err(PoolError::PermanentlyFailed(_)) => report.fenced.push(name),
            Err(e) => {
                error!(mcp = %name, error = %e, "Restart failed");
                if pool.status(&name) == Some(ServerStatus::PermanentlyFailed) {
                    report.fenced.push(name);
                } else {
                    report.restart_failed.push(name);
                }
            }
        }
    }

    if !report.is_quiet() {
        debug!(?report, "Health sweep complete");
    }
    report
}

// === Health Monitor ===

/// Periodic background task driving a pool sweep
#[derive(Debug)]
pub struct HealthMonitor {
    label: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Run `sweep` every `interval` until `cancel` fires
    ///
    /// The first sweep happens one interval after spawning.
    pub fn spawn<F, Fut>(
        label: &'static str,
        interval: Duration,
        cancel: CancellationToken,
        sweep: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sweep() => {}
                }
            }
            debug!(monitor = label, "Health monitor loop ended");
        });

        info!(monitor = label, interval_ms = %interval.as_millis(), "Health monitor started");
        Self {
            label,
            cancel,
            handle: Some(handle),
        }
    }

    /// Whether the background task is still active
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the monitor and wait briefly for the task to end
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(monitor = self.label, "Health monitor did not stop in time");
            }
        }
        info!(monitor = self.label, "Health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_pool::config::PoolConfig;
    use crate::mcp_pool::process_supervisor::LaunchSpec;
    use crate::mcp_pool::restart_policy::RestartStats;
    use crate::mcp_pool::socket_proxy::ProxyContext;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn test_config(temp_dir: &TempDir) -> PoolConfig {
        PoolConfig {
            socket_dir: Some(temp_dir.path().to_path_buf()),
            log_dir: Some(temp_dir.path().join("logs")),
            stop_grace: Duration::from_secs(2),
            term_grace: Duration::from_secs(1),
            ..PoolConfig::default()
        }
    }

    fn pool_with(config: PoolConfig) -> Arc<SocketPool> {
        Arc::new(SocketPool::new(ProxyContext::new(config), &CancellationToken::new()).unwrap())
    }

    async fn wait_for_status(pool: &SocketPool, name: &str, status: ServerStatus) {
        for _ in 0..150 {
            if pool.status(name) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{name} never reached {status}");
    }

    // ==================== Monitor Tests ====================

    #[tokio::test]
    async fn test_monitor_ticks_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let mut monitor = HealthMonitor::spawn(
            "test",
            Duration::from_millis(20),
            CancellationToken::new(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.is_running());
        monitor.stop().await;
        assert!(!monitor.is_running());

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several sweeps, saw {seen}");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_monitor_stops_with_parent_token() {
        let parent = CancellationToken::new();
        let mut monitor =
            HealthMonitor::spawn("test", Duration::from_secs(60), parent.child_token(), || async {});

        parent.cancel();
        assert!(!monitor.is_running());
        monitor.stop().await;
    }

    #[test]
    fn test_quiet_report() {
        assert!(HealthReport::default().is_quiet());
        let report = HealthReport {
            restarted: vec!["memory".to_string()],
            ..HealthReport::default()
        };
        assert!(!report.is_quiet());
    }

    // ==================== Sweep Tests ====================

    #[tokio::test]
    async fn test_sweep_restarts_crashed_proxy() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool_with(test_config(&temp_dir));
        let spec = LaunchSpec::new(
            "sh",
            vec!["-c".to_string(), "sleep 0.2".to_string()],
            HashMap::new(),
        );

        pool.start("flaky", spec).await.unwrap();
        wait_for_status(&pool, "flaky", ServerStatus::Failed).await;

        let report = pool.check_health().await;
        assert_eq!(report.restarted, vec!["flaky".to_string()]);
        assert_eq!(pool.restart_stats("flaky").unwrap().restart_count, 1);

        // Crashes again; the next restart is too soon
        wait_for_status(&pool, "flaky", ServerStatus::Failed).await;
        let report = pool.check_health().await;
        assert_eq!(report.rate_limited, vec!["flaky".to_string()]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_fences_entry_at_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool_with(test_config(&temp_dir));
        let spec = LaunchSpec::new("sh", vec!["-c".to_string(), "exit 1".to_string()], HashMap::new());

        pool.start("doomed", spec).await.unwrap();
        wait_for_status(&pool, "doomed", ServerStatus::Failed).await;
        for (name, proxy) in pool.snapshot() {
            if name == "doomed" {
                proxy.set_restart_stats(RestartStats::with_failures(10));
            }
        }

        let report = pool.check_health().await;
        assert_eq!(report.fenced, vec!["doomed".to_string()]);
        assert_eq!(pool.status("doomed"), Some(ServerStatus::PermanentlyFailed));

        // Fenced entries are skipped from now on
        assert!(pool.check_health().await.is_quiet());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_forgives_stable_proxy() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.restart.stable_after = Duration::ZERO;
        let pool = pool_with(config);

        pool.start("steady", LaunchSpec::new("cat", vec![], HashMap::new()))
            .await
            .unwrap();
        for (_, proxy) in pool.snapshot() {
            proxy.set_restart_stats(RestartStats::with_failures(3));
        }

        let report = pool.check_health().await;
        assert_eq!(report.forgiven, vec!["steady".to_string()]);
        let stats = pool.restart_stats("steady").unwrap();
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.restart_count, 0);

        // Nothing left to forgive
        assert!(pool.check_health().await.is_quiet());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_skips_external_entries() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let path = config.socket_path("shared");
        let pool = pool_with(config);

        let listener = UnixListener::bind(&path).unwrap();
        assert!(pool.register_external("shared", path));
        drop(listener);

        assert!(pool.check_health().await.is_quiet());
        assert_eq!(pool.status("shared"), Some(ServerStatus::Running));
    }
}
