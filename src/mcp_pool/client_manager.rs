// ABOUTME: Client session set for a socket proxy
//
// Tracks connected clients with:
// - Session ids of the form `{mcp}-client-{n}`
// - A hard cap on concurrent clients (checked and inserted under one lock)
// - A bounded outbound queue per client, drained by that client's writer
// - A cancellation token per client so the proxy can force-close connections
//
// A full queue applies backpressure: the sender waits up to a deadline for
// room, then disconnects the stalled client. Lines are never rerouted to
// another client because one queue is full.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One newline-free message, shared between every client it is sent to
pub type Line = Arc<[u8]>;

/// Outbound messages buffered per client before senders start waiting
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Outcome of queueing a line for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the client
    Delivered,
    /// The session is not connected (or its writer already ended)
    Gone,
    /// The queue stayed full past the deadline; the client was disconnected
    Stalled,
}

// === Session ID ===

/// Identifier of one client connection, unique within a proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Session id for the `n`th client of `mcp_name`
    pub fn new(mcp_name: &str, n: u64) -> Self {
        Self(format!("{mcp_name}-client-{n}"))
    }

    /// The id as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === Client Errors ===

/// Errors that can occur during client management
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Client limit reached for this MCP
    #[error("Maximum clients reached: {max}")]
    MaxClientsReached {
        /// Configured cap
        max: usize,
    },
}

// === Client Registration ===

#[derive(Debug)]
struct ClientHandle {
    outbound: mpsc::Sender<Line>,
    cancel: CancellationToken,
}

/// Everything a client task needs after registration
#[derive(Debug)]
pub struct ClientSlot {
    /// Assigned session id
    pub session: SessionId,
    /// Messages to write to the client
    pub outbound: mpsc::Receiver<Line>,
    /// Cancelled when the proxy closes this client
    pub cancel: CancellationToken,
}

/// Connected clients of one proxy
#[derive(Debug)]
pub struct ClientRegistry {
    mcp_name: String,
    max_clients: usize,
    next_id: AtomicU64,
    clients: Mutex<HashMap<SessionId, ClientHandle>>,
}

impl ClientRegistry {
    /// Create an empty registry capped at `max_clients`
    pub fn new(mcp_name: impl Into<String>, max_clients: usize) -> Self {
        Self {
            mcp_name: mcp_name.into(),
            max_clients,
            next_id: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client unless the cap is reached
    ///
    /// The client's token is a child of `parent`, so stopping the proxy
    /// closes every client.
    pub fn register(&self, parent: &CancellationToken) -> Result<ClientSlot, ClientError> {
        let mut clients = self.lock();
        if clients.len() >= self.max_clients {
            return Err(ClientError::MaxClientsReached {
                max: self.max_clients,
            });
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = SessionId::new(&self.mcp_name, n);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let cancel = parent.child_token();

        clients.insert(
            session.clone(),
            ClientHandle {
                outbound: tx,
                cancel: cancel.clone(),
            },
        );

        Ok(ClientSlot {
            session,
            outbound: rx,
            cancel,
        })
    }

    fn handle_of(&self, session: &SessionId) -> Option<(mpsc::Sender<Line>, CancellationToken)> {
        self.lock()
            .get(session)
            .map(|h| (h.outbound.clone(), h.cancel.clone()))
    }

    /// Queue `line` for one client, waiting up to `wait` for queue space
    ///
    /// A client whose queue stays full is disconnected and the line dropped.
    pub async fn deliver(&self, session: &SessionId, line: &Line, wait: Duration) -> Delivery {
        let Some((outbound, cancel)) = self.handle_of(session) else {
            return Delivery::Gone;
        };
        Self::push(session, &outbound, &cancel, line, wait).await
    }

    /// Queue `line` for every client; returns how many accepted it
    ///
    /// Clients with room are served first; stalled ones are waited on
    /// concurrently, each up to `wait`.
    pub async fn broadcast(&self, line: &Line, wait: Duration) -> usize {
        let targets: Vec<_> = self
            .lock()
            .iter()
            .map(|(session, h)| (session.clone(), h.outbound.clone(), h.cancel.clone()))
            .collect();

        let pushes = targets
            .iter()
            .map(|(session, outbound, cancel)| Self::push(session, outbound, cancel, line, wait));
        join_all(pushes)
            .await
            .into_iter()
            .filter(|d| *d == Delivery::Delivered)
            .count()
    }

    async fn push(
        session: &SessionId,
        outbound: &mpsc::Sender<Line>,
        cancel: &CancellationToken,
        line: &Line,
        wait: Duration,
    ) -> Delivery {
        let pending = match outbound.try_send(Arc::clone(line)) {
            Ok(()) => return Delivery::Delivered,
            Err(TrySendError::Closed(_)) => return Delivery::Gone,
            Err(TrySendError::Full(pending)) => pending,
        };

        match outbound.send_timeout(pending, wait).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    session = %session,
                    wait_ms = %wait.as_millis(),
                    "Client not reading, disconnecting"
                );
                cancel.cancel();
                Delivery::Stalled
            }
        }
    }

    /// Forget a client; true if it was registered
    pub fn remove(&self, session: &SessionId) -> bool {
        self.lock().remove(session).is_some()
    }

    /// Force-close every client; returns how many were closed
    pub fn close_all(&self) -> usize {
        let drained: Vec<ClientHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }

    /// Whether `session` is connected
    pub fn contains(&self, session: &SessionId) -> bool {
        self.lock().contains_key(session)
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no client is connected
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured cap
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }
}
