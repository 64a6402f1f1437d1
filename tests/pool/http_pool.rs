// ABOUTME: HTTP pool behavior against an in-process HTTP endpoint

use std::sync::Arc;
use std::time::Duration;

use mcpool::mcp_pool::{HttpPool, HttpServerError, HttpServerSpec, ServerStatus};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{free_addr, http_responder, serve_status, sh, test_ctx};

fn pool(dir: &TempDir) -> Arc<HttpPool> {
    Arc::new(HttpPool::new(test_ctx(dir), &CancellationToken::new()))
}

#[tokio::test]
async fn test_reachable_url_is_adopted_not_spawned() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);
    let (addr, endpoint) = http_responder(404).await;

    let spec = HttpServerSpec {
        launch: sh("exit 1"),
        ..HttpServerSpec::external(format!("http://{addr}/mcp"))
    };
    pool.start("docs", spec).await.unwrap();

    let server = pool.get("docs").unwrap();
    assert!(server.is_running());
    assert!(!server.started_by_us());
    assert!(server.pid().is_none());

    pool.shutdown().await;
    assert_eq!(server.status(), ServerStatus::Running, "external servers are left alone");
    endpoint.abort();
}

#[tokio::test]
async fn test_server_error_status_is_unreachable() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);
    let (addr, endpoint) = http_responder(502).await;

    let err = pool
        .start("broken", HttpServerSpec::external(format!("http://{addr}/")))
        .await
        .unwrap_err();
    assert!(matches!(err, HttpServerError::NoCommand(_)));
    assert!(!pool.is_running("broken"));
    endpoint.abort();
}

#[tokio::test]
async fn test_spawned_server_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);
    let addr = free_addr().await;

    let endpoint = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        serve_status(TcpListener::bind(addr).await.unwrap(), 200).await;
    });

    let spec = HttpServerSpec {
        launch: sh("sleep 30"),
        startup_timeout: Duration::from_secs(5),
        ..HttpServerSpec::external(format!("http://{addr}/mcp"))
    };
    pool.start("local", spec).await.unwrap();
    let server = pool.get("local").unwrap();
    assert!(server.started_by_us());
    assert_eq!(pool.running_count(), 1);

    let listed = pool.list();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].started_by_us);
    assert_eq!(listed[0].url, format!("http://{addr}/mcp"));

    pool.shutdown().await;
    assert_eq!(server.status(), ServerStatus::Stopped);
    assert!(server.pid().is_none());
    endpoint.abort();
}

#[tokio::test]
async fn test_startup_timeout_reported() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir);
    let addr = free_addr().await;

    let spec = HttpServerSpec {
        launch: sh("sleep 30"),
        startup_timeout: Duration::from_millis(500),
        ..HttpServerSpec::external(format!("http://{addr}/"))
    };
    let err = pool.start("never", spec).await.unwrap_err();
    assert!(matches!(err, HttpServerError::StartupTimeout { .. }));

    let server = pool.get("never").unwrap();
    assert_eq!(server.status(), ServerStatus::Failed);
    assert!(server.last_error().unwrap().contains("not ready"));

    pool.shutdown().await;
}
