//! Pulse Link
//!
//! Client-side manager for a single realtime pub/sub connection: idempotent
//! connects, remembered group membership, automatic reconnection with
//! backoff, failure escalation and typed message fan-out.

pub mod connection;
pub mod error;
pub mod global;
pub mod heartbeat;
pub mod scheduler;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionConfig, ConnectionManager, ProcessRestart, RecoveryAction};
pub use error::{ConnectError, ConnectResult};
pub use heartbeat::{HeartbeatConfig, HeartbeatHandle, HeartbeatMonitor, ProbeOutcome};
pub use pulse_shared::state_machine::ConnectionState;
pub use pulse_shared::{GroupName, Identity, Message};
pub use subscription::{Subscription, SubscriptionRegistry};
