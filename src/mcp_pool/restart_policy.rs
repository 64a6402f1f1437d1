// ABOUTME: Restart rate limiting and permanent-failure fencing
//
// The policy is pure: it looks at a proxy's RestartStats and a caller-supplied
// instant and says whether a restart may proceed. Bookkeeping updates return a
// new RestartStats so a rejected attempt leaves the old one untouched.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::duration_secs;

/// Why a restart attempt was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestartDenied {
    /// Cumulative failures reached the ceiling; the entry is fenced
    #[error("cumulative failures ({failures}) reached the limit of {limit}")]
    FailureCeiling {
        /// Failures recorded so far
        failures: u32,
        /// Configured ceiling
        limit: u32,
    },

    /// Last restart was too recent
    #[error("restarted {elapsed:?} ago, minimum interval is {min:?}")]
    TooSoon {
        /// Time since the last restart
        elapsed: Duration,
        /// Configured minimum interval
        min: Duration,
    },

    /// Too many restarts inside the trailing window
    #[error("{count} restarts in the last {window:?}")]
    WindowExhausted {
        /// Restarts inside the window
        count: usize,
        /// Window length
        window: Duration,
    },
}

impl RestartDenied {
    /// Whether this denial should fence the entry permanently
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::FailureCeiling { .. })
    }
}

/// Invalid restart policy values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicyError {
    /// A ceiling of zero would fence every entry on first failure
    #[error("max_total_failures must be at least 1")]
    ZeroFailureCeiling,

    /// A window allowing no restarts disables recovery entirely
    #[error("max_restarts_per_window must be at least 1")]
    ZeroRestartsPerWindow,

    /// Window shorter than the minimum interval can never hold two restarts
    #[error("window ({window:?}) must be at least min_restart_interval ({min:?})")]
    WindowTooShort {
        /// Configured window
        window: Duration,
        /// Configured minimum interval
        min: Duration,
    },
}

/// Restart rate limits for pooled socket servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Cumulative failures after which an entry is fenced
    pub max_total_failures: u32,

    /// Minimum time between two restarts of one entry
    #[serde(with = "duration_secs")]
    pub min_restart_interval: Duration,

    /// Trailing window used to count recent restarts
    #[serde(with = "duration_secs")]
    pub window: Duration,

    /// Restarts allowed inside one window
    pub max_restarts_per_window: usize,

    /// Continuous running time after which counters are forgiven
    #[serde(with = "duration_secs")]
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_total_failures: 10,
            min_restart_interval: Duration::from_secs(5),
            window: Duration::from_secs(60),
            max_restarts_per_window: 3,
            stable_after: Duration::from_secs(300),
        }
    }
}

/// Restart bookkeeping carried from one proxy generation to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartStats {
    /// When the entry was last restarted
    pub last_restart: Option<Instant>,
    /// Restarts since the counters were last forgiven
    pub restart_count: u32,
    /// Failures over the entry's lifetime (start failures included)
    pub total_failures: u32,
    recent: VecDeque<Instant>,
}

impl RestartStats {
    /// Stats seeded with a failure count, as after a run of failed starts
    pub fn with_failures(total_failures: u32) -> Self {
        Self {
            total_failures,
            ..Self::default()
        }
    }

    fn recent_within(&self, window: Duration, now: Instant) -> usize {
        self.recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }
}

impl RestartPolicy {
    /// Reject values that would make recovery impossible
    pub fn validate(&self) -> Result<(), RestartPolicyError> {
        if self.max_total_failures == 0 {
            return Err(RestartPolicyError::ZeroFailureCeiling);
        }
        if self.max_restarts_per_window == 0 {
            return Err(RestartPolicyError::ZeroRestartsPerWindow);
        }
        if self.window < self.min_restart_interval {
            return Err(RestartPolicyError::WindowTooShort {
                window: self.window,
                min: self.min_restart_interval,
            });
        }
        Ok(())
    }

    /// Whether the entry has reached the failure ceiling
    pub const fn is_exhausted(&self, stats: &RestartStats) -> bool {
        stats.total_failures >= self.max_total_failures
    }

    /// Decide whether a restart may run at `now`
    pub fn check(&self, stats: &RestartStats, now: Instant) -> Result<(), RestartDenied> {
        if self.is_exhausted(stats) {
            return Err(RestartDenied::FailureCeiling {
                failures: stats.total_failures,
                limit: self.max_total_failures,
            });
        }

        if let Some(last) = stats.last_restart {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_restart_interval {
                return Err(RestartDenied::TooSoon {
                    elapsed,
                    min: self.min_restart_interval,
                });
            }
        }

        let count = stats.recent_within(self.window, now);
        if count >= self.max_restarts_per_window {
            return Err(RestartDenied::WindowExhausted {
                count,
                window: self.window,
            });
        }

        Ok(())
    }

    /// Bookkeeping after a restart attempt at `now`
    ///
    /// Both outcomes count as a restart; a failed start also counts as a failure.
    pub fn record_attempt(&self, stats: &RestartStats, now: Instant, succeeded: bool) -> RestartStats {
        let mut recent: VecDeque<Instant> = stats
            .recent
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t) < self.window)
            .collect();
        recent.push_back(now);

        RestartStats {
            last_restart: Some(now),
            restart_count: stats.restart_count.saturating_add(1),
            total_failures: if succeeded {
                stats.total_failures
            } else {
                stats.total_failures.saturating_add(1)
            },
            recent,
        }
    }

    /// Whether an entry running since `running_since` has earned a reset
    pub fn is_stable(&self, running_since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(running_since) >= self.stable_after
    }

    /// Counters after forgiveness; the last restart time is kept
    pub fn forgive(stats: &RestartStats) -> RestartStats {
        RestartStats {
            last_restart: stats.last_restart,
            ..RestartStats::default()
        }
    }
}
