// ABOUTME: Shared fixtures for the pool integration tests
//
// Provides:
// - test_config/test_ctx: pool settings rooted in a temp dir
// - TestClient: line-oriented Unix socket client with timeouts
// - http_responder: minimal HTTP endpoint on a local port

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use mcpool::mcp_pool::{LaunchSpec, PoolConfig, ProxyContext};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UnixStream};
use tokio::task::JoinHandle;

pub fn test_config(dir: &TempDir) -> PoolConfig {
    PoolConfig {
        socket_dir: Some(dir.path().to_path_buf()),
        log_dir: Some(dir.path().join("logs")),
        stop_grace: Duration::from_secs(2),
        term_grace: Duration::from_secs(1),
        ..PoolConfig::default()
    }
}

pub fn test_ctx(dir: &TempDir) -> ProxyContext {
    ProxyContext::new(test_config(dir))
}

/// `cat` echoes every request back, which makes it a perfect echo MCP server
pub fn cat() -> LaunchSpec {
    LaunchSpec::new("cat", vec![], HashMap::new())
}

pub fn sh(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh", vec!["-c".to_string(), script.to_string()], HashMap::new())
}

pub fn request(id: u64) -> String {
    format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"tools/list"}}"#)
}

pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line, or `None` once the proxy closed the connection
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for line")
            .ok()
            .flatten()
    }

    /// True if nothing arrives within `wait`
    pub async fn recv_nothing(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.lines.next_line()).await.is_err()
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..150 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

/// Serve `status` to every HTTP request on `listener`
pub async fn serve_status(listener: TcpListener, status: u16) {
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

pub async fn http_responder(status: u16) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, tokio::spawn(serve_status(listener, status)))
}

/// A local address with nothing listening
pub async fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}
