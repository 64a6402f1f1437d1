// ABOUTME: Unix socket proxy wrapping a single MCP server process
// ABOUTME: Multiplexes many socket clients onto one MCP stdio stream

//! Socket proxy for MCP server multiplexing.
//!
//! The `SocketProxy` owns one MCP server process and exposes it via a Unix
//! domain socket. Any number of clients (up to a cap) can connect at once.
//! Lines from clients are forwarded verbatim to the MCP's stdin; lines from
//! the MCP's stdout are routed back by JSON-RPC id, or broadcast when they
//! carry no id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SocketProxy                            │
//! │                                                             │
//! │  accept loop ──► reader + writer per connection             │
//! │                     │ record id -> session                  │
//! │                     ▼                                       │
//! │               stdin writer ──► MCP process (own pgroup)     │
//! │                                     │                       │
//! │  client queues ◄── broadcast loop ◄─┘ stdout                │
//! │   (routed by id, or to everyone)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! When the MCP's stdout ends the proxy marks itself failed, closes every
//! client and the listener, and waits to be replaced by the pool. A proxy is
//! never restarted in place.
//!
//! # Usage
//!
//! ```ignore
//! use mcpool::mcp_pool::{LaunchSpec, ProxyContext, SocketProxy};
//! use tokio_util::sync::CancellationToken;
//!
//! let ctx = ProxyContext::default();
//! let root = CancellationToken::new();
//! let proxy = SocketProxy::new("memory", LaunchSpec::new("cat", vec![], Default::default()), &ctx, &root);
//!
//! proxy.start().await?;
//! // Clients can now connect to proxy.socket_path()
//! proxy.stop().await;
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client_manager::{ClientRegistry, ClientSlot, Delivery, Line, SessionId};
use super::config::PoolConfig;
use super::discovery::{is_socket_alive, remove_socket_file};
use super::events::{
    EventAggregator, EventSink, COMPONENT_SOCKET_PROXY, EVENT_CLIENT_CONNECT,
    EVENT_CLIENT_DISCONNECT, EVENT_CLIENT_REJECTED,
};
use super::process_supervisor::{
    LaunchSpec, ProcessSupervisor, SpawnOptions, SupervisedProcess, SupervisorError,
};
use super::request_router::{CorrelationMap, Envelope};
use super::restart_policy::RestartStats;
use super::status::{ServerStatus, StatusCell};

/// Lines buffered between client tasks and the MCP's stdin
const STDIN_QUEUE_CAPACITY: usize = 1024;

// === Proxy Errors ===

/// Errors that can occur during proxy operation
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Process management error
    #[error("Process error: {0}")]
    Process(#[from] SupervisorError),

    /// The listening socket could not be created
    #[error("Failed to bind {path}: {source}")]
    Bind {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The spawned process came up without piped stdio
    #[error("MCP process has no {0} pipe")]
    MissingPipe(&'static str),

    /// A start is already in progress
    #[error("Proxy is already starting")]
    AlreadyStarting,

    /// The proxy has been fenced
    #[error("Proxy is permanently failed")]
    PermanentlyFailed,
}

// === Shared Context ===

/// Collaborators handed to every proxy a pool creates
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// Pool configuration
    pub config: Arc<PoolConfig>,
    /// Sink for client connect/disconnect events
    pub events: Arc<dyn EventSink>,
    /// Spawns and signals MCP processes
    pub supervisor: ProcessSupervisor,
}

impl ProxyContext {
    /// Context with the given config and a fresh aggregator
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config: Arc::new(config),
            events: Arc::new(EventAggregator::default()),
            supervisor: ProcessSupervisor::default(),
        }
    }
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// State shared between the proxy and its background tasks
#[derive(Debug)]
struct ProxyShared {
    name: String,
    status: StatusCell,
    clients: ClientRegistry,
    requests: CorrelationMap,
    /// Cancelled to close the listener; child of the proxy token
    listener_cancel: CancellationToken,
    events: Arc<dyn EventSink>,
    /// Longest line read from a client or the MCP
    max_line_bytes: usize,
    /// How long routing waits on a client with a full queue
    write_timeout: Duration,
}

impl ProxyShared {
    /// Route one line from the MCP to its client, or to everyone
    ///
    /// A response goes only to the session that sent the request. It is
    /// broadcast only when that session has already left.
    async fn route_from_mcp(&self, line: &Line) {
        if let Envelope::WithId(id) = Envelope::parse(line) {
            if let Some(session) = self.requests.take(&id) {
                match self.clients.deliver(&session, line, self.write_timeout).await {
                    Delivery::Delivered => return,
                    Delivery::Stalled => {
                        warn!(
                            mcp = %self.name,
                            session = %session,
                            id = %id,
                            "Dropped response for stalled client"
                        );
                        return;
                    }
                    Delivery::Gone => debug!(
                        mcp = %self.name,
                        session = %session,
                        id = %id,
                        "Response for departed client, broadcasting"
                    ),
                }
            }
        }
        self.clients.broadcast(line, self.write_timeout).await;
    }

    /// Tear down after the MCP's stdout ended
    fn fail(&self) {
        match self.status.transition(ServerStatus::Failed) {
            Ok(_) => warn!(mcp = %self.name, "MCP process output ended, proxy failed"),
            Err(e) => debug!(mcp = %self.name, reason = %e, "Output ended after stop"),
        }
        let closed = self.clients.close_all();
        self.requests.clear();
        self.listener_cancel.cancel();
        if closed > 0 {
            info!(mcp = %self.name, clients = closed, "Disconnected clients of failed proxy");
        }
    }
}

// === Socket Proxy Implementation ===

/// Unix domain socket proxy for a single MCP server.
#[derive(Debug)]
pub struct SocketProxy {
    /// Name of this MCP server (e.g., "context7")
    name: String,

    /// Command, args and env used to spawn the MCP
    spec: LaunchSpec,

    /// Unix socket path
    socket_path: PathBuf,

    /// Stderr log of the MCP
    log_path: PathBuf,

    /// False for proxies adopted from another instance
    started_by_us: bool,

    shared: Arc<ProxyShared>,

    /// Proxy context; cancelling it terminates everything the proxy owns
    cancel: CancellationToken,

    process: Mutex<Option<SupervisedProcess>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,

    restart_stats: Mutex<RestartStats>,

    ctx: ProxyContext,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketProxy {
    /// Create a proxy that will spawn and own its MCP process
    pub fn new(
        name: impl Into<String>,
        spec: LaunchSpec,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Self {
        Self::build(name.into(), spec, None, true, ServerStatus::Stopped, ctx, parent)
    }

    /// Create a proxy for a socket served by another instance
    ///
    /// It starts out `Running`, owns no process and never signals one.
    pub fn external(
        name: impl Into<String>,
        socket_path: PathBuf,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Self {
        Self::build(
            name.into(),
            LaunchSpec::default(),
            Some(socket_path),
            false,
            ServerStatus::Running,
            ctx,
            parent,
        )
    }

    /// Adopt a live socket at the conventional path, or prepare to spawn one
    pub async fn attach_or_new(
        name: impl Into<String>,
        spec: LaunchSpec,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Self {
        let name = name.into();
        let path = ctx.config.socket_path(&name);
        if is_socket_alive(&path, ctx.config.liveness_dial_timeout).await {
            info!(mcp = %name, socket = %path.display(), "Reusing socket from another instance");
            // Keep the spec so a later restart can take the name over
            return Self::build(name, spec, Some(path), false, ServerStatus::Running, ctx, parent);
        }
        Self::new(name, spec, ctx, parent)
    }

    fn build(
        name: String,
        spec: LaunchSpec,
        socket_path: Option<PathBuf>,
        started_by_us: bool,
        initial: ServerStatus,
        ctx: &ProxyContext,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let socket_path = socket_path.unwrap_or_else(|| ctx.config.socket_path(&name));
        let log_path = ctx.config.socket_log_path(&name);

        let shared = Arc::new(ProxyShared {
            name: name.clone(),
            status: StatusCell::new(initial),
            clients: ClientRegistry::new(name.clone(), ctx.config.max_clients_per_proxy),
            requests: CorrelationMap::new(),
            listener_cancel: cancel.child_token(),
            events: Arc::clone(&ctx.events),
            max_line_bytes: ctx.config.max_line_bytes,
            write_timeout: ctx.config.client_write_timeout,
        });

        Self {
            name,
            spec,
            socket_path,
            log_path,
            started_by_us,
            shared,
            cancel,
            process: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            restart_stats: Mutex::new(RestartStats::default()),
            ctx: ctx.clone(),
        }
    }

    /// Start the socket proxy.
    ///
    /// Spawns the MCP process in its own process group, binds the socket and
    /// starts the accept, broadcast and stdin writer tasks. Adopted proxies
    /// and proxies already running return immediately.
    pub async fn start(&self) -> Result<(), ProxyError> {
        match self.shared.status.get() {
            ServerStatus::Running => return Ok(()),
            ServerStatus::PermanentlyFailed => return Err(ProxyError::PermanentlyFailed),
            _ => {}
        }
        if !self.started_by_us {
            return Ok(());
        }
        if self.shared.status.transition(ServerStatus::Starting).is_err() {
            return Err(ProxyError::AlreadyStarting);
        }

        info!(mcp = %self.name, socket = %self.socket_path.display(), "Starting socket proxy");

        // A leftover socket file would make bind fail with EADDRINUSE
        remove_socket_file(&self.socket_path);

        let options = SpawnOptions {
            own_process_group: true,
            pipe_stdio: true,
            log_file: Some(self.log_path.clone()),
            term_grace: self.ctx.config.term_grace,
        };
        let spawned = match self
            .ctx
            .supervisor
            .spawn(&self.spec, &options, self.cancel.clone())
        {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(mcp = %self.name, error = %e, "Failed to spawn MCP process");
                self.mark_start_failed();
                return Err(e.into());
            }
        };

        let (Some(stdin), Some(stdout)) = (spawned.stdin, spawned.stdout) else {
            self.abandon(&spawned.process).await;
            return Err(ProxyError::MissingPipe("stdio"));
        };

        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(source) => {
                warn!(mcp = %self.name, error = %source, "Failed to bind proxy socket");
                self.abandon(&spawned.process).await;
                return Err(ProxyError::Bind {
                    path: self.socket_path.clone(),
                    source,
                });
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                warn!(mcp = %self.name, error = %e, "Failed to restrict socket permissions");
            }
        }

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE_CAPACITY);
        let handles = vec![
            tokio::spawn(stdin_writer_loop(
                self.name.clone(),
                stdin,
                stdin_rx,
                self.cancel.clone(),
            )),
            tokio::spawn(broadcast_loop(
                Arc::clone(&self.shared),
                stdout,
                self.cancel.clone(),
            )),
            tokio::spawn(accept_loop(
                Arc::clone(&self.shared),
                listener,
                stdin_tx,
                self.cancel.clone(),
            )),
        ];

        let pid = spawned.process.pid();
        *lock(&self.process) = Some(spawned.process);
        lock(&self.tasks).extend(handles);

        if self
            .shared
            .status
            .transition_from(ServerStatus::Starting, ServerStatus::Running)
        {
            info!(mcp = %self.name, pid = pid, "Socket proxy started");
        }
        Ok(())
    }

    fn mark_start_failed(&self) {
        if let Err(e) = self.shared.status.transition(ServerStatus::Failed) {
            debug!(mcp = %self.name, reason = %e, "Start failure after stop");
        }
    }

    /// Kill a process whose proxy could not be brought up
    async fn abandon(&self, process: &SupervisedProcess) {
        if let Err(e) = process.force_kill() {
            warn!(mcp = %self.name, error = %e, "Failed to kill MCP after start failure");
        }
        if process.wait_exit(Duration::from_secs(1)).await.is_none() {
            warn!(mcp = %self.name, pid = process.pid(), "MCP still running after start failure kill");
        }
        self.mark_start_failed();
    }

    /// Stop the socket proxy.
    ///
    /// Idempotent. Closes clients and the listener, closes the MCP's stdin and
    /// signals its process group, force-killing it if it outlives the grace
    /// period. The socket file is removed even for adopted proxies, but their
    /// process is never signalled.
    pub async fn stop(&self) {
        let previous = self.shared.status.get();
        if self.shared.status.transition(ServerStatus::Stopped).is_err() {
            debug!(mcp = %self.name, "Stopping permanently failed proxy");
        }
        if previous != ServerStatus::Stopped {
            info!(mcp = %self.name, started_by_us = self.started_by_us, "Stopping socket proxy");
        }

        self.cancel.cancel();
        self.shared.clients.close_all();
        self.shared.requests.clear();

        let process = lock(&self.process).take();
        if let Some(process) = process {
            if process
                .await_exit_or_kill(self.ctx.config.stop_grace)
                .await
                .is_some()
            {
                debug!(mcp = %self.name, pid = process.pid(), "MCP process exited");
            }
        }

        remove_socket_file(&self.socket_path);

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for handle in tasks {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                debug!(mcp = %self.name, "Proxy task did not finish in time");
            }
        }
    }

    /// Dial the socket to confirm something is accepting connections
    pub async fn is_alive(&self) -> bool {
        is_socket_alive(&self.socket_path, self.ctx.config.liveness_dial_timeout).await
    }

    /// Name of the MCP server
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch spec used for (re)starts
    pub const fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Unix socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether this instance spawned the MCP
    pub const fn started_by_us(&self) -> bool {
        self.started_by_us
    }

    /// Current lifecycle state
    pub fn status(&self) -> ServerStatus {
        self.shared.status.get()
    }

    /// When the proxy last entered `Running`
    pub fn running_since(&self) -> Option<std::time::Instant> {
        self.shared.status.running_since()
    }

    /// Fence this proxy; no further starts are possible
    ///
    /// Returns true if the proxy was not fenced before.
    pub fn mark_permanently_failed(&self) -> bool {
        match self.shared.status.transition(ServerStatus::PermanentlyFailed) {
            Ok(previous) => previous != ServerStatus::PermanentlyFailed,
            Err(e) => {
                warn!(mcp = %self.name, reason = %e, "Could not fence proxy");
                false
            }
        }
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.requests.len()
    }

    /// Whether every pending request belongs to a connected client
    pub fn correlation_consistent(&self) -> bool {
        self.shared
            .requests
            .sessions()
            .iter()
            .all(|s| self.shared.clients.contains(s))
    }

    /// OS pid of the owned MCP process
    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(SupervisedProcess::pid)
    }

    /// Restart bookkeeping carried across generations
    pub fn restart_stats(&self) -> RestartStats {
        lock(&self.restart_stats).clone()
    }

    /// Replace the restart bookkeeping
    pub fn set_restart_stats(&self, stats: RestartStats) {
        *lock(&self.restart_stats) = stats;
    }
}

impl Drop for SocketProxy {
    fn drop(&mut self) {
        // Terminates the process group and all tasks. The socket file is left
        // alone: a replacement proxy may already own the path.
        self.cancel.cancel();
    }
}

// === Background Tasks ===

/// One newline-delimited frame
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(Bytes),
    /// A line over the limit; its bytes are discarded up to the next newline
    Oversized,
}

/// Newline codec that reports oversized lines as frames
///
/// The stream keeps decoding what is already buffered after an oversized
/// line instead of pausing on an error.
#[derive(Debug)]
struct BoundedLines(AnyDelimiterCodec);

impl BoundedLines {
    fn new(max_bytes: usize) -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            max_bytes,
        ))
    }

    fn frame(decoded: Result<Option<Bytes>, AnyDelimiterCodecError>) -> io::Result<Option<Frame>> {
        match decoded {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for BoundedLines {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.0.decode_eof(buf))
    }
}

/// Newline-delimited frames of at most `max_bytes`
fn line_frames<R: AsyncRead>(reader: R, max_bytes: usize) -> FramedRead<R, BoundedLines> {
    FramedRead::new(reader, BoundedLines::new(max_bytes))
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Accept connections until the listener is cancelled
async fn accept_loop(
    shared: Arc<ProxyShared>,
    listener: UnixListener,
    stdin_tx: mpsc::Sender<Line>,
    clients_parent: CancellationToken,
) {
    debug!(mcp = %shared.name, "Accepting connections on socket");

    loop {
        let accepted = tokio::select! {
            () = shared.listener_cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => match shared.clients.register(&clients_parent) {
                Ok(slot) => {
                    shared
                        .events
                        .record(COMPONENT_SOCKET_PROXY, EVENT_CLIENT_CONNECT);
                    debug!(mcp = %shared.name, session = %slot.session, "Client connected");
                    tokio::spawn(client_task(
                        Arc::clone(&shared),
                        stream,
                        slot,
                        stdin_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(mcp = %shared.name, error = %e, "Rejecting client connection");
                    shared
                        .events
                        .record(COMPONENT_SOCKET_PROXY, EVENT_CLIENT_REJECTED);
                    drop(stream);
                }
            },
            Err(e) => {
                warn!(mcp = %shared.name, error = %e, "Accept error");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    debug!(mcp = %shared.name, "Listener closed");
}

/// Serve one client until either direction ends
///
/// Reading and writing run as separate tasks so a client waiting on a busy
/// MCP stdin is still sent its responses.
async fn client_task(
    shared: Arc<ProxyShared>,
    stream: UnixStream,
    slot: ClientSlot,
    stdin_tx: mpsc::Sender<Line>,
) {
    let ClientSlot {
        session,
        outbound,
        cancel,
    } = slot;
    let (read_half, write_half) = stream.into_split();

    let writer = tokio::spawn(client_writer(
        Arc::clone(&shared),
        session.clone(),
        write_half,
        outbound,
        cancel.clone(),
    ));
    client_reader(&shared, &session, read_half, &stdin_tx, &cancel).await;
    cancel.cancel();
    if let Err(e) = writer.await {
        warn!(mcp = %shared.name, session = %session, error = %e, "Client writer task failed");
    }

    // Correlations first: nothing may point at a session missing from the set
    let orphaned = shared.requests.remove_session(&session);
    shared.clients.remove(&session);
    shared
        .events
        .record(COMPONENT_SOCKET_PROXY, EVENT_CLIENT_DISCONNECT);
    debug!(
        mcp = %shared.name,
        session = %session,
        orphaned_requests = orphaned,
        "Client disconnected"
    );
}

/// Forward client lines to the MCP until EOF, an oversized line, or cancel
async fn client_reader(
    shared: &ProxyShared,
    session: &SessionId,
    read_half: OwnedReadHalf,
    stdin_tx: &mpsc::Sender<Line>,
    cancel: &CancellationToken,
) {
    let mut incoming = line_frames(read_half, shared.max_line_bytes);

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = incoming.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Line(raw))) => {
                forward_to_mcp(shared, session, strip_line_ending(&raw), stdin_tx).await;
            }
            None => break,
            Some(Ok(Frame::Oversized)) => {
                warn!(
                    mcp = %shared.name,
                    session = %session,
                    max_bytes = shared.max_line_bytes,
                    "Client line too long, disconnecting"
                );
                break;
            }
            Some(Err(e)) => {
                debug!(mcp = %shared.name, session = %session, error = %e, "Client read error");
                break;
            }
        }
    }
}

/// Write routed lines to the client until cancelled or the socket fails
async fn client_writer(
    shared: Arc<ProxyShared>,
    session: SessionId,
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Line>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::new(write_half);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(line) = message else { break };
        // A client that stops reading must not pin this task once it is closed
        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = write_line(&mut writer, &line) => written,
        };
        if let Err(e) = written {
            debug!(mcp = %shared.name, session = %session, error = %e, "Client write error");
            break;
        }
    }

    cancel.cancel();
}

async fn forward_to_mcp(
    shared: &ProxyShared,
    session: &SessionId,
    raw: &[u8],
    stdin_tx: &mpsc::Sender<Line>,
) {
    match Envelope::parse(raw) {
        Envelope::Invalid => {
            debug!(mcp = %shared.name, session = %session, "Dropping malformed client message");
            return;
        }
        Envelope::WithId(id) => shared.requests.record(id, session.clone()),
        Envelope::Notification => {}
    }

    if stdin_tx.send(Line::from(raw)).await.is_err() {
        debug!(mcp = %shared.name, session = %session, "MCP stdin closed, message dropped");
    }
}

async fn write_line<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(line).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Write queued client lines to the MCP's stdin; dropping stdin closes it
async fn stdin_writer_loop(
    name: String,
    stdin: ChildStdin,
    mut rx: mpsc::Receiver<Line>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::new(stdin);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(line) = message else { break };
        if let Err(e) = write_line(&mut writer, &line).await {
            warn!(mcp = %name, error = %e, "Write to MCP stdin failed");
            break;
        }
    }

    debug!(mcp = %name, "MCP stdin writer ended");
}

/// Route MCP output to clients until it ends
///
/// Oversized lines are skipped; the stream resumes at the next newline.
async fn broadcast_loop(shared: Arc<ProxyShared>, stdout: ChildStdout, cancel: CancellationToken) {
    let mut lines = line_frames(stdout, shared.max_line_bytes);

    loop {
        let frame = tokio::select! {
            // Stop owns the teardown
            () = cancel.cancelled() => return,
            frame = lines.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Line(raw))) => {
                let raw = strip_line_ending(&raw);
                if raw.is_empty() {
                    continue;
                }
                let line = Line::from(raw);
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shared.route_from_mcp(&line) => {}
                }
            }
            Some(Ok(Frame::Oversized)) => warn!(
                mcp = %shared.name,
                max_bytes = shared.max_line_bytes,
                "Skipping oversized line from MCP"
            ),
            Some(Err(e)) => {
                warn!(mcp = %shared.name, error = %e, "Read from MCP stdout failed");
                break;
            }
            None => break,
        }
    }

    shared.fail();
}
