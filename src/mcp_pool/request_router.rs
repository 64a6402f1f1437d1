// ABOUTME: JSON-RPC id extraction and request/response correlation
// ABOUTME: Maps in-flight request ids to the client session that sent them

//! Request correlation for JSON-RPC multiplexing.
//!
//! Several clients share one MCP process over a single stdio stream. Lines are
//! forwarded verbatim in both directions; the proxy only looks at the `id` of
//! each message so a response can be routed back to the client that issued the
//! request.
//!
//! # Flow
//!
//! 1. Client `c1` sends `{"id": 1, ...}`; the proxy records `1 -> c1`
//! 2. The line goes to the MCP's stdin unchanged
//! 3. MCP answers `{"id": 1, ...}`; the proxy takes `1` out of the map and
//!    writes the line to `c1` only
//!
//! Ids are not rewritten, so two clients using the same id at the same time
//! collide: the most recent sender wins the mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::client_manager::SessionId;

/// Correlation key for a JSON-RPC id
///
/// JSON-RPC allows numbers and strings. Numbers that do not fit an i64 are
/// keyed by their JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// Integer id (most common for auto-incrementing clients)
    Number(i64),
    /// String id
    String(String),
    /// Any other non-null id, keyed by its JSON text
    Other(String),
}

impl RequestId {
    /// Parse from a JSON value; `null` yields `None`
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => Some(
                n.as_i64()
                    .map_or_else(|| Self::Other(n.to_string()), Self::Number),
            ),
            Value::String(s) => Some(Self::String(s.clone())),
            other => Some(Self::Other(other.to_string())),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// What the proxy learned from one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A JSON object carrying a non-null id
    WithId(RequestId),
    /// A JSON object without an id, or with `id: null` (a notification)
    Notification,
    /// Not a JSON object
    Invalid,
}

impl Envelope {
    /// Classify a raw line without validating anything beyond the id
    pub fn parse(line: &[u8]) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(line) else {
            return Self::Invalid;
        };
        map.get("id")
            .and_then(RequestId::from_json)
            .map_or(Self::Notification, Self::WithId)
    }
}

/// In-flight request id -> issuing session
#[derive(Debug, Default)]
pub struct CorrelationMap {
    pending: Mutex<HashMap<RequestId, SessionId>>,
}

impl CorrelationMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, SessionId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember that `session` is waiting for `id`
    pub fn record(&self, id: RequestId, session: SessionId) {
        self.lock().insert(id, session);
    }

    /// Remove and return the session waiting for `id`
    pub fn take(&self, id: &RequestId) -> Option<SessionId> {
        self.lock().remove(id)
    }

    /// Drop every entry owned by `session`; returns how many were removed
    pub fn remove_session(&self, session: &SessionId) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, owner| owner != session);
        before - pending.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sessions currently referenced by the map
    pub fn sessions(&self) -> Vec<SessionId> {
        self.lock().values().cloned().collect()
    }
}
