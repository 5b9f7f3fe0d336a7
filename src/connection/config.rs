//! Connection manager configuration

use anyhow::{bail, Context, Result};
use pulse_shared::timing;
use std::time::Duration;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// First reconnect delay; also the value the backoff resets to
    pub backoff_floor: Duration,
    /// Maximum reconnect delay
    pub backoff_ceiling: Duration,
    /// Upper bound of the random jitter added per attempt
    pub backoff_jitter: Duration,
    /// Time allowed between opening a transport and its `connected` event
    pub handshake_timeout: Duration,
    /// Escalate to hard recovery when no connection succeeds for this long
    pub escalation_window: Duration,
    /// Group joined by every identity
    pub broadcast_group: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_millis(timing::BACKOFF_FLOOR_MS),
            backoff_ceiling: Duration::from_millis(timing::BACKOFF_CEILING_MS),
            backoff_jitter: Duration::from_millis(timing::BACKOFF_JITTER_MS),
            handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
            escalation_window: Duration::from_millis(timing::ESCALATION_WINDOW_MS),
            broadcast_group: timing::BROADCAST_GROUP.into(),
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `PULSE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_millis("PULSE_BACKOFF_FLOOR_MS")? {
            config.backoff_floor = ms;
        }
        if let Some(ms) = env_millis("PULSE_BACKOFF_CEILING_MS")? {
            config.backoff_ceiling = ms;
        }
        if let Some(ms) = env_millis("PULSE_BACKOFF_JITTER_MS")? {
            config.backoff_jitter = ms;
        }
        if let Some(ms) = env_millis("PULSE_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = ms;
        }
        if let Some(ms) = env_millis("PULSE_ESCALATION_WINDOW_MS")? {
            config.escalation_window = ms;
        }
        if let Ok(group) = std::env::var("PULSE_BROADCAST_GROUP") {
            config.broadcast_group = group;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_floor.is_zero() {
            bail!("Backoff floor must be > 0");
        }
        if self.backoff_ceiling < self.backoff_floor {
            bail!("Backoff ceiling must be >= backoff floor");
        }
        if self.backoff_jitter > self.backoff_floor {
            bail!("Backoff jitter must be <= backoff floor");
        }
        if self.handshake_timeout.is_zero() {
            bail!("Handshake timeout must be > 0");
        }
        if self.escalation_window.is_zero() {
            bail!("Escalation window must be > 0");
        }
        if self.broadcast_group.trim().is_empty() {
            bail!("Broadcast group must not be blank");
        }
        Ok(())
    }
}

/// Read a millisecond duration from the environment
pub(crate) fn env_millis(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds", key))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}
