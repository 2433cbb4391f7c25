//! Streaming sessions: one blocking acquisition thread per device, a
//! bridge task onto tokio, and the supervisor that starts, stops, retunes
//! and sweeps them.
//!
//! Errors are [`rf_sdr::Error`]; this crate adds no failure modes of its own.

pub mod acquisition;
pub mod bridge;
pub mod options;
pub mod stats;
pub mod supervisor;
pub mod sweep;

pub use acquisition::{AcquisitionLoop, Command, ConfigCell, LoopExit, LoopState};
pub use bridge::StreamBridge;
pub use options::StreamOptions;
pub use rf_sdr::{Error, Result};
pub use stats::{SessionStatus, StatsSnapshot, StatusCell, StreamStats};
pub use supervisor::StreamSupervisor;
pub use sweep::SweepPlan;
