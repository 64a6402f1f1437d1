// ABOUTME: Lifecycle status shared by socket proxies and HTTP servers
//
// ServerStatus is the closed set of states; StatusCell is the lock-guarded
// state machine that owns one of them. Callers can read the current state or
// attempt a transition, never assign a state directly.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a pooled server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Not running; initial state and the state after an intentional stop
    Stopped,
    /// Spawned, waiting to become ready
    Starting,
    /// Ready to accept clients
    Running,
    /// Crashed or failed to start; eligible for restart
    Failed,
    /// Fenced after too many failures; never restarted again
    PermanentlyFailed,
}

impl ServerStatus {
    /// Lowercase name used in logs and listings
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Whether `self -> to` is a legal edge of the lifecycle graph
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            // Absorbing
            (Self::PermanentlyFailed, Self::PermanentlyFailed) => true,
            (Self::PermanentlyFailed, _) => false,
            (_, Self::PermanentlyFailed | Self::Stopped) => true,
            (Self::Stopped | Self::Failed, Self::Starting) => true,
            // Stopped/Failed -> Running covers adopting a server someone else started
            (Self::Starting | Self::Stopped | Self::Failed | Self::Running, Self::Running) => true,
            (Self::Starting | Self::Running, Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Rejected status transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    /// State at the time of the attempt
    pub from: ServerStatus,
    /// Requested state
    pub to: ServerStatus,
}

#[derive(Debug)]
struct StatusInner {
    status: ServerStatus,
    running_since: Option<Instant>,
}

/// Lock-guarded lifecycle state machine
///
/// Guarded by its own lock so a status read never waits on client or
/// correlation bookkeeping.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<StatusInner>,
}

impl StatusCell {
    /// Create a cell in the given initial state
    pub fn new(initial: ServerStatus) -> Self {
        let running_since = (initial == ServerStatus::Running).then(Instant::now);
        Self {
            inner: Mutex::new(StatusInner {
                status: initial,
                running_since,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current state
    pub fn get(&self) -> ServerStatus {
        self.lock().status
    }

    /// When the cell last entered `Running`, if it is running now
    pub fn running_since(&self) -> Option<Instant> {
        self.lock().running_since
    }

    /// Attempt to move to `to`; fails without change if the edge is illegal
    pub fn transition(&self, to: ServerStatus) -> Result<ServerStatus, TransitionError> {
        let mut inner = self.lock();
        let from = inner.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        Self::apply(&mut inner, to);
        Ok(from)
    }

    /// Move to `to` only if the current state is `expected`
    ///
    /// Returns true when the transition happened.
    pub fn transition_from(&self, expected: ServerStatus, to: ServerStatus) -> bool {
        let mut inner = self.lock();
        if inner.status != expected || !expected.can_transition_to(to) {
            return false;
        }
        Self::apply(&mut inner, to);
        true
    }

    fn apply(inner: &mut StatusInner, to: ServerStatus) {
        if to == ServerStatus::Running {
            if inner.status != ServerStatus::Running {
                inner.running_since = Some(Instant::now());
            }
        } else {
            inner.running_since = None;
        }
        inner.status = to;
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(ServerStatus::Stopped)
    }
}
