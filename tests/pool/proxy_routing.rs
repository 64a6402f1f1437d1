// ABOUTME: Socket proxy behavior through real sockets and a real MCP stand-in
//
// Covers request/response correlation across concurrent clients (including
// slow readers and clients leaving mid-response), the client cap, and what
// clients observe when the MCP process dies.

use std::time::Duration;

use mcpool::mcp_pool::{PoolConfig, ProxyContext, ServerStatus, SocketProxy};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{cat, request, sh, test_config, test_ctx, wait_until, TestClient};

#[tokio::test]
async fn test_concurrent_clients_receive_only_their_responses() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    let proxy = SocketProxy::new("echo", cat(), &ctx, &CancellationToken::new());
    proxy.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(TestClient::connect(proxy.socket_path()).await);
    }
    wait_until(|| proxy.client_count() == 8).await;

    for (i, client) in clients.iter_mut().enumerate() {
        client.send(&request(100 + i as u64)).await;
    }

    for (i, client) in clients.iter_mut().enumerate() {
        assert_eq!(client.recv().await, Some(request(100 + i as u64)));
    }
    for client in &mut clients {
        assert!(client.recv_nothing(Duration::from_millis(100)).await);
    }

    wait_until(|| proxy.pending_requests() == 0).await;
    proxy.stop().await;
}

#[tokio::test]
async fn test_correlation_map_tracks_client_set() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    // Reads requests but never answers, so every id stays pending
    let proxy = SocketProxy::new("silent", sh("cat > /dev/null"), &ctx, &CancellationToken::new());
    proxy.start().await.unwrap();

    let mut keep = TestClient::connect(proxy.socket_path()).await;
    let mut leave = TestClient::connect(proxy.socket_path()).await;
    wait_until(|| proxy.client_count() == 2).await;

    keep.send(&request(1)).await;
    leave.send(&request(2)).await;
    leave.send(&request(3)).await;
    wait_until(|| proxy.pending_requests() == 3).await;
    assert!(proxy.correlation_consistent());

    drop(leave);
    wait_until(|| proxy.client_count() == 1).await;
    wait_until(|| proxy.pending_requests() == 1).await;
    assert!(proxy.correlation_consistent());

    proxy.stop().await;
    assert_eq!(proxy.pending_requests(), 0);
    drop(keep);
}

#[tokio::test]
async fn test_client_cap_of_one_hundred() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    assert_eq!(ctx.config.max_clients_per_proxy, 100);
    let proxy = SocketProxy::new("busy", cat(), &ctx, &CancellationToken::new());
    proxy.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..100 {
        clients.push(TestClient::connect(proxy.socket_path()).await);
    }
    wait_until(|| proxy.client_count() == 100).await;

    let mut rejected = TestClient::connect(proxy.socket_path()).await;
    assert_eq!(rejected.recv().await, None);
    assert_eq!(proxy.client_count(), 100);

    // Earlier connections are unaffected
    clients[99].send(&request(7)).await;
    assert_eq!(clients[99].recv().await, Some(request(7)));

    proxy.stop().await;
}

#[tokio::test]
async fn test_mcp_exit_disconnects_everyone() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    let proxy = SocketProxy::new("doomed", sh("sleep 0.5"), &ctx, &CancellationToken::new());
    proxy.start().await.unwrap();

    let mut a = TestClient::connect(proxy.socket_path()).await;
    let mut b = TestClient::connect(proxy.socket_path()).await;
    wait_until(|| proxy.client_count() == 2).await;
    a.send(&request(1)).await;

    assert_eq!(a.recv().await, None);
    assert_eq!(b.recv().await, None);
    wait_until(|| proxy.status() == ServerStatus::Failed).await;
    assert_eq!(proxy.client_count(), 0);
    assert_eq!(proxy.pending_requests(), 0);
    assert!(!proxy.is_alive().await);

    proxy.stop().await;
    assert!(!proxy.socket_path().exists());
}

#[tokio::test]
async fn test_notifications_reach_every_client() {
    let dir = TempDir::new().unwrap();
    let ctx = ProxyContext::new(PoolConfig {
        max_clients_per_proxy: 10,
        ..test_config(&dir)
    });
    let proxy = SocketProxy::new("notify", cat(), &ctx, &CancellationToken::new());
    proxy.start().await.unwrap();

    let mut a = TestClient::connect(proxy.socket_path()).await;
    let mut b = TestClient::connect(proxy.socket_path()).await;
    wait_until(|| proxy.client_count() == 2).await;

    // No id, so cat's echo is a notification from the server's point of view
    let notification = r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#;
    a.send(notification).await;
    assert_eq!(a.recv().await.as_deref(), Some(notification));
    assert_eq!(b.recv().await.as_deref(), Some(notification));

    proxy.stop().await;
}

/// Waits for `count` requests, then answers ids 1..=count in one burst of
/// large responses and stays alive
fn burst_responder(count: usize, pad_bytes: usize) -> String {
    format!(
        "pad=$(head -c {pad_bytes} /dev/zero | tr '\\0' x); \
         i=0; while [ $i -lt {count} ]; do read line; i=$((i+1)); done; \
         i=1; while [ $i -le {count} ]; do \
           printf '{{\"jsonrpc\":\"2.0\",\"id\":%d,\"result\":{{\"pad\":\"%s\"}}}}\\n' $i \"$pad\"; \
           i=$((i+1)); \
         done; \
         cat > /dev/null"
    )
}

#[tokio::test]
async fn test_slow_reader_keeps_its_responses() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    let proxy = SocketProxy::new(
        "bursty",
        sh(&burst_responder(600, 8192)),
        &ctx,
        &CancellationToken::new(),
    );
    proxy.start().await.unwrap();

    let mut slow = TestClient::connect(proxy.socket_path()).await;
    let mut bystander = TestClient::connect(proxy.socket_path()).await;
    wait_until(|| proxy.client_count() == 2).await;

    for id in 1..=600 {
        slow.send(&request(id)).await;
    }

    // Far more than the per-client queue and socket buffers can hold
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(bystander.recv_nothing(Duration::from_millis(100)).await);

    for id in 1..=600 {
        let line = slow.recv().await.expect("slow reader was disconnected");
        let prefix = format!(r#"{{"jsonrpc":"2.0","id":{id},"#);
        assert!(line.starts_with(&prefix), "expected id {id}");
    }

    assert!(bystander.recv_nothing(Duration::from_millis(200)).await);
    assert_eq!(proxy.client_count(), 2);
    assert_eq!(proxy.pending_requests(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_leaving_mid_response_does_not_reroute_live_responses() {
    let dir = TempDir::new().unwrap();
    let ctx = test_ctx(&dir);
    // Answers the first two requests together after a pause
    let proxy = SocketProxy::new(
        "laggy",
        sh(r#"read a; read b; sleep 0.5; echo "$a"; echo "$b"; cat > /dev/null"#),
        &ctx,
        &CancellationToken::new(),
    );
    proxy.start().await.unwrap();

    let mut leaving = TestClient::connect(proxy.socket_path()).await;
    let mut asker = TestClient::connect(proxy.socket_path()).await;
    let mut watcher = TestClient::connect(proxy.socket_path()).await;
    wait_until(|| proxy.client_count() == 3).await;

    leaving.send(&request(1)).await;
    wait_until(|| proxy.pending_requests() == 1).await;
    drop(leaving);
    wait_until(|| proxy.client_count() == 2).await;
    assert_eq!(proxy.pending_requests(), 0);

    asker.send(&request(2)).await;

    // The departed client's answer has no owner left and is broadcast
    assert_eq!(asker.recv().await, Some(request(1)));
    assert_eq!(watcher.recv().await, Some(request(1)));

    // The live client's answer goes to it alone
    assert_eq!(asker.recv().await, Some(request(2)));
    assert!(watcher.recv_nothing(Duration::from_millis(300)).await);
    assert!(proxy.correlation_consistent());

    proxy.stop().await;
}
