//! Periodic liveness probing of the realtime link

mod monitor;

pub use monitor::{HeartbeatConfig, HeartbeatHandle, HeartbeatMonitor, ProbeOutcome};
