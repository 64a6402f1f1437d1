// ABOUTME: Reconnecting stdio <-> Unix socket bridge for MCP clients
//
// An MCP client launches `mcpool bridge <socket>` as its stdio server. Lines
// from stdin go to the pooled socket and lines from the socket go to stdout.
// When the proxy behind the socket restarts, the bridge redials with
// exponential backoff instead of exiting, so the client keeps its session.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that end a bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Every dial attempt failed
    #[error("Could not connect to {path} after {attempts} attempts")]
    GaveUp {
        /// Socket path
        path: PathBuf,
        /// Attempts made
        attempts: u32,
    },

    /// Reading stdin or writing stdout failed
    #[error("Stdio error: {0}")]
    Stdio(#[source] io::Error),
}

/// Why a bridge ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// Stdin reached end of file
    InputClosed,
    /// The cancellation token fired
    Cancelled,
}

/// Exponential backoff calculator for redial delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `max`
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// Returns `min(base * 2^attempt, max)` and advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);
        std::cmp::min(delay, self.max)
    }

    /// Start over from `base`
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delays handed out since the last reset
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Bridge tunables
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// First redial delay
    pub initial_delay: Duration,
    /// Redial delay cap
    pub max_delay: Duration,
    /// Timeout of one dial
    pub dial_timeout: Duration,
    /// Consecutive failed dials before giving up
    pub max_attempts: u32,
    /// Pause after losing a connection
    pub reconnect_pause: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(2),
            max_attempts: 120,
            reconnect_pause: Duration::from_millis(100),
        }
    }
}

enum Session {
    InputClosed,
    Cancelled,
    /// Socket lost; carries a line read from stdin but not delivered
    Disconnected(Option<String>),
}

/// Reconnecting line bridge between a reader/writer pair and a socket
#[derive(Debug, Clone)]
pub struct SocketBridge {
    socket_path: PathBuf,
    options: BridgeOptions,
}

impl SocketBridge {
    /// Bridge to `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>, options: BridgeOptions) -> Self {
        Self {
            socket_path: socket_path.into(),
            options,
        }
    }

    /// Socket this bridge dials
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run until `input` closes, `cancel` fires, or dialing gives up
    ///
    /// # Errors
    ///
    /// Returns `GaveUp` after `max_attempts` consecutive failed dials and
    /// `Stdio` if `input` or `output` fail.
    pub async fn run<R, W>(
        &self,
        input: R,
        mut output: W,
        cancel: CancellationToken,
    ) -> Result<BridgeExit, BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut input = BufReader::new(input).lines();
        let mut backoff =
            ExponentialBackoff::new(self.options.initial_delay, self.options.max_delay);
        let mut pending: Option<String> = None;

        loop {
            let Some(stream) = self.dial(&mut backoff, &cancel).await? else {
                return Ok(BridgeExit::Cancelled);
            };
            backoff.reset();
            info!(socket = %self.socket_path.display(), "Bridge connected");

            match self
                .session(stream, &mut input, &mut output, pending.take(), &cancel)
                .await?
            {
                Session::InputClosed => return Ok(BridgeExit::InputClosed),
                Session::Cancelled => return Ok(BridgeExit::Cancelled),
                Session::Disconnected(unsent) => {
                    warn!(socket = %self.socket_path.display(), "Bridge lost connection, reconnecting");
                    pending = unsent;
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(BridgeExit::Cancelled),
                        () = tokio::time::sleep(self.options.reconnect_pause) => {}
                    }
                }
            }
        }
    }

    /// Dial with backoff; `None` if cancelled
    async fn dial(
        &self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<Option<UnixStream>, BridgeError> {
        let mut attempts = 0u32;
        loop {
            match tokio::time::timeout(
                self.options.dial_timeout,
                UnixStream::connect(&self.socket_path),
            )
            .await
            {
                Ok(Ok(stream)) => return Ok(Some(stream)),
                Ok(Err(e)) => debug!(socket = %self.socket_path.display(), error = %e, "Dial failed"),
                Err(_) => debug!(socket = %self.socket_path.display(), "Dial timed out"),
            }

            attempts += 1;
            if attempts >= self.options.max_attempts {
                return Err(BridgeError::GaveUp {
                    path: self.socket_path.clone(),
                    attempts,
                });
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn session<R, W>(
        &self,
        stream: UnixStream,
        input: &mut Lines<BufReader<R>>,
        output: &mut W,
        pending: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Session, BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = stream.into_split();
        let mut socket_lines = BufReader::new(read_half).lines();

        if let Some(line) = pending {
            if write_line(&mut write_half, &line).await.is_err() {
                return Ok(Session::Disconnected(Some(line)));
            }
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(Session::Cancelled),

                read = input.next_line() => {
                    match read.map_err(BridgeError::Stdio)? {
                        None => return Ok(Session::InputClosed),
                        Some(text) => {
                            if write_line(&mut write_half, &text).await.is_err() {
                                return Ok(Session::Disconnected(Some(text)));
                            }
                        }
                    }
                }

                incoming = socket_lines.next_line() => {
                    match incoming {
                        Ok(Some(text)) => {
                            write_line(output, &text).await.map_err(BridgeError::Stdio)?;
                        }
                        Ok(None) => return Ok(Session::Disconnected(None)),
                        Err(e) => {
                            debug!(error = %e, "Socket read failed");
                            return Ok(Session::Disconnected(None));
                        }
                    }
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
