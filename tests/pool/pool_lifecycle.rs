// ABOUTME: Socket pool lifecycle through the public API
//
// Idempotent start, discovery of sockets served elsewhere, rate-limited
// restarts and shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;

use mcpool::mcp_pool::{
    Availability, PoolConfig, PoolError, ProxyContext, ServerStatus, SocketPool,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{cat, request, sh, test_config, test_ctx, wait_until, TestClient};

fn pool(dir: &TempDir) -> Arc<SocketPool> {
    Arc::new(SocketPool::new(test_ctx(dir), &CancellationToken::new()).unwrap())
}

#[tokio::test]
async fn test_second_start_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);

    pool.start("echo", cat()).await.unwrap();
    let socket = pool.socket_path("echo").unwrap();
    pool.start("echo", cat()).await.unwrap();

    assert_eq!(pool.list().len(), 1);
    assert_eq!(pool.socket_path("echo"), Some(socket.clone()));
    assert!(pool.is_running("echo").await);

    let mut client = TestClient::connect(&socket).await;
    client.send(&request(1)).await;
    assert_eq!(client.recv().await, Some(request(1)));

    pool.shutdown().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_dead_proxy_reported_not_running() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);

    pool.start("short", sh("sleep 0.3")).await.unwrap();
    wait_until(|| pool.status("short") == Some(ServerStatus::Failed)).await;

    assert!(!pool.is_running("short").await);
    assert_eq!(pool.availability("short"), Availability::TemporarilyFailed);
    assert_eq!(pool.availability("missing"), Availability::Absent);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_discovered_socket_is_external_and_removed_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let path = config.socket_path("shared");

    // Another instance serving the socket
    let listener = UnixListener::bind(&path).unwrap();
    let other_instance = tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });

    let pool = SocketPool::new(ProxyContext::new(config), &CancellationToken::new()).unwrap();
    assert_eq!(pool.discover_existing_sockets().await.unwrap(), 1);

    let info = pool.list();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].name, "shared");
    assert!(!info[0].started_by_us);
    assert_eq!(info[0].status, ServerStatus::Running);
    assert!(pool.is_running("shared").await);

    pool.shutdown().await;
    assert!(!path.exists());
    assert!(!other_instance.is_finished(), "the other instance keeps running");
    other_instance.abort();
}

#[tokio::test]
async fn test_second_restart_within_interval_is_rate_limited() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);
    pool.start("echo", cat()).await.unwrap();

    pool.restart_with_rate_limit("echo").await.unwrap();
    let after_first = pool.restart_stats("echo").unwrap();
    assert_eq!(after_first.restart_count, 1);
    assert_eq!(after_first.total_failures, 0);

    let err = pool.restart_with_rate_limit("echo").await.unwrap_err();
    assert!(matches!(err, PoolError::RateLimited { .. }));
    assert_eq!(pool.restart_stats("echo").unwrap(), after_first);
    assert!(pool.is_running("echo").await);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_initialize_applies_admission_policy() {
    let dir = TempDir::new().unwrap();
    let config = PoolConfig {
        pool_all: false,
        include_mcps: vec!["wanted".to_string()],
        ..test_config(&dir)
    };
    let pool = Arc::new(SocketPool::new(ProxyContext::new(config), &CancellationToken::new()).unwrap());

    let mut servers = BTreeMap::new();
    servers.insert("wanted".to_string(), cat());
    servers.insert("ignored".to_string(), cat());

    assert_eq!(pool.initialize(&servers).await.unwrap(), 1);
    assert!(pool.contains("wanted"));
    assert!(!pool.contains("ignored"));

    pool.shutdown().await;
    assert!(pool.is_shut_down());
    assert!(matches!(
        pool.start("late", cat()).await,
        Err(PoolError::ShutDown)
    ));
}
