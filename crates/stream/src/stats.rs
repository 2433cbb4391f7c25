// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Counters shared by the acquisition thread, the bridge and whoever
/// reports on them. Only ever incremented.
#[derive(Debug, Default)]
pub struct StreamStats {
    captured: AtomicU64,
    delivered: AtomicU64,
    queue_drops: AtomicU64,
    channel_drops: AtomicU64,
    overflows: AtomicU64,
    timeouts: AtomicU64,
    recoveries: AtomicU64,
}

/// Whether a drop count is worth a log line: the first, then every 100th.
pub(crate) fn should_log_drop(count: u64) -> bool {
    count == 1 || count % 100 == 0
}

impl StreamStats {
    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total.
    pub fn record_queue_drop(&self) -> u64 {
        self.queue_drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the running total.
    pub fn record_channel_drop(&self) -> u64 {
        self.channel_drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the running total.
    pub fn record_overflow(&self) -> u64 {
        self.overflows.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            channel_drops: self.channel_drops.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub delivered: u64,
    pub queue_drops: u64,
    pub channel_drops: u64,
    pub overflows: u64,
    pub timeouts: u64,
    pub recoveries: u64,
}

impl StatsSnapshot {
    /// Blocks lost between capture and the consumer.
    pub fn dropped(&self) -> u64 {
        self.queue_drops + self.channel_drops
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured: {} delivered: {} dropped: {} (queue {}, channel {}) overflows: {} timeouts: {} recoveries: {}",
            self.captured,
            self.delivered,
            self.dropped(),
            self.queue_drops,
            self.channel_drops,
            self.overflows,
            self.timeouts,
            self.recoveries,
        )
    }
}

/// Lifecycle of the current (or last) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
    Recovering,
    Stopped,
    Failed(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::Starting => f.write_str("starting"),
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Recovering => f.write_str("recovering"),
            SessionStatus::Stopped => f.write_str("stopped"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Shared, thread-safe [`SessionStatus`].
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<Mutex<SessionStatus>>);

impl Default for StatusCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(SessionStatus::Idle)))
    }
}

impl StatusCell {
    pub fn get(&self) -> SessionStatus {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, status: SessionStatus) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != status {
            log::debug!("session status: {} -> {}", *guard, status);
            *guard = status;
        }
    }

    /// Set `status` unless the session already failed.
    pub fn settle(&self, status: SessionStatus) {
        if !matches!(self.get(), SessionStatus::Failed(_)) {
            self.set(status);
        }
    }
}
