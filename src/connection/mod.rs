//! Connection management for the realtime link
//!
//! This module handles:
//! - Idempotent, coalesced connects per identity
//! - Automatic reconnection with capped, jittered backoff
//! - Remembering group membership and rejoining it after every reconnect
//! - Escalating to a hard recovery when reconnection keeps failing

mod backoff;
mod config;
mod escalation;
mod groups;
mod manager;

pub use backoff::Backoff;
pub use config::ConnectionConfig;
pub(crate) use config::env_millis;
pub use escalation::{EscalationTracker, ProcessRestart, RecoveryAction, RESTART_EXIT_CODE};
pub use groups::GroupMembership;
pub use manager::ConnectionManager;
