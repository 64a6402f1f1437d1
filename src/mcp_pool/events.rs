// ABOUTME: Aggregation of high-frequency pool events
//
// Client connects and disconnects happen far too often to log one line each.
// Proxies report them to an EventSink instead; the default EventAggregator
// counts them per (component, event) and emits one summary line per pair on a
// fixed interval.
//
// Ordinary lifecycle logging goes through `tracing` directly: the subscriber is
// resolved when each event fires, so tests can capture it with a scoped
// subscriber.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Component tag used by socket proxies
pub const COMPONENT_SOCKET_PROXY: &str = "mcp_socket_proxy";

/// A client connected to a proxy
pub const EVENT_CLIENT_CONNECT: &str = "client_connect";
/// A client disconnected from a proxy
pub const EVENT_CLIENT_DISCONNECT: &str = "client_disconnect";
/// A client was turned away at the cap
pub const EVENT_CLIENT_REJECTED: &str = "client_rejected";

/// Default flush interval of the aggregator
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Receiver of high-frequency events
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Count one occurrence of `event` in `component`
    fn record(&self, component: &'static str, event: &'static str);
}

type Key = (&'static str, &'static str);

#[derive(Debug, Default)]
struct Counters {
    pending: HashMap<Key, u64>,
    totals: HashMap<Key, u64>,
}

/// Batches events and logs a summary per interval
#[derive(Debug)]
pub struct EventAggregator {
    interval: Duration,
    counters: Mutex<Counters>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}

impl EventAggregator {
    /// Create an aggregator flushing every `interval` (30s when zero)
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Occurrences recorded since the aggregator was created
    pub fn total(&self, component: &str, event: &str) -> u64 {
        self.lock()
            .totals
            .iter()
            .find(|((c, e), _)| *c == component && *e == event)
            .map_or(0, |(_, n)| *n)
    }

    /// Occurrences waiting for the next flush
    pub fn pending(&self, component: &str, event: &str) -> u64 {
        self.lock()
            .pending
            .iter()
            .find(|((c, e), _)| *c == component && *e == event)
            .map_or(0, |(_, n)| *n)
    }

    /// Emit one summary per pending pair and reset the window
    ///
    /// Returns the number of summaries emitted.
    pub fn flush(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending);
        let window_seconds = self.interval.as_secs();
        for ((component, event), count) in &pending {
            info!(component, event, count, window_seconds, "event_summary");
        }
        pending.len()
    }

    /// Flush on every interval until `cancel` fires, then flush once more
    pub fn spawn_flush_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.flush();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            self.flush();
        })
    }
}

impl EventSink for EventAggregator {
    fn record(&self, component: &'static str, event: &'static str) {
        let mut counters = self.lock();
        *counters.pending.entry((component, event)).or_insert(0) += 1;
        *counters.totals.entry((component, event)).or_insert(0) += 1;
    }
}
