// Copyright 2025-2026 CEMAXECUTER LLC

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rf_sdr::{Error, Result};

/// Sizing and timing of one streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Blocks held between the acquisition thread and the bridge
    pub queue_capacity: usize,
    /// Blocks held for the consumer
    pub channel_capacity: usize,
    /// Upper bound on one hardware read
    pub read_timeout_ms: u64,
    /// Bridge sleep when the queue is empty
    pub bridge_poll_ms: u64,
    /// Pause between closing a failed stream and reopening it
    pub recovery_pause_ms: u64,
    /// How long stop waits for each side before giving up on it
    pub stop_timeout_ms: u64,
    /// How long start and reconfigure wait for the stream to come up
    pub setup_timeout_ms: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 20,
            channel_capacity: 16,
            read_timeout_ms: 50,
            bridge_poll_ms: 10,
            recovery_pause_ms: 100,
            stop_timeout_ms: 2000,
            setup_timeout_ms: 5000,
        }
    }
}

impl StreamOptions {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 || self.channel_capacity == 0 {
            return Err(Error::InvalidParameter(
                "queue and channel capacity must be non-zero".into(),
            ));
        }
        if self.read_timeout_ms == 0 || self.bridge_poll_ms == 0 {
            return Err(Error::InvalidParameter(
                "read timeout and bridge poll must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn bridge_poll(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_ms)
    }

    pub fn recovery_pause(&self) -> Duration {
        Duration::from_millis(self.recovery_pause_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}
