//! Heartbeat Monitor
//!
//! Runs a background task that checks the link on a fixed period and
//! reconnects (then re-joins any extra groups) when it finds it down.

use crate::connection::{env_millis, ConnectionManager};
use crate::error::ConnectError;
use anyhow::{bail, Result};
use pulse_shared::timing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat settings
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Probe period
    pub interval: Duration,
    /// Groups joined after every reconnect the monitor performs, on top of
    /// the ones the manager already remembers
    pub groups: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            groups: Vec::new(),
        }
    }
}

impl HeartbeatConfig {
    /// Reads `PULSE_HEARTBEAT_INTERVAL_MS` and comma-separated `PULSE_HEARTBEAT_GROUPS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(interval) = env_millis("PULSE_HEARTBEAT_INTERVAL_MS")? {
            if interval.is_zero() {
                bail!("Heartbeat interval must be > 0");
            }
            config.interval = interval;
        }
        if let Ok(groups) = std::env::var("PULSE_HEARTBEAT_GROUPS") {
            config.groups = groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(config)
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Link was up
    Healthy,
    /// Link was down and has been re-established
    Recovered,
    /// Link was down and reconnecting failed
    Failed(ConnectError),
}

/// Keeps one identity connected
#[derive(Clone)]
pub struct HeartbeatMonitor {
    manager: ConnectionManager,
    identity: String,
    config: HeartbeatConfig,
    active: Arc<AtomicBool>,
}

impl HeartbeatMonitor {
    pub fn new(manager: ConnectionManager, identity: impl Into<String>, config: HeartbeatConfig) -> Self {
        Self {
            manager,
            identity: identity.into(),
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Check the link once, reconnecting if it is down
    pub async fn probe(&self) -> ProbeOutcome {
        if self.manager.is_connected() {
            return ProbeOutcome::Healthy;
        }

        info!("[HEARTBEAT] Link down, reconnecting as {}", self.identity);
        if let Err(e) = self.manager.connect(&self.identity).await {
            warn!("[HEARTBEAT] Reconnect failed: {}", e);
            return ProbeOutcome::Failed(e);
        }

        for group in &self.config.groups {
            if let Err(e) = self.manager.join_group(group).await {
                warn!("[HEARTBEAT] Could not join {}: {}", group, e);
            }
        }
        ProbeOutcome::Recovered
    }

    /// Start the probing task; the first probe runs one interval from now
    pub fn start(&self) -> Result<HeartbeatHandle> {
        if self.active.swap(true, Ordering::SeqCst) {
            bail!("Heartbeat monitoring already active");
        }

        let monitor = self.clone();
        let period = self.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !monitor.is_active() {
                    break;
                }
                match monitor.probe().await {
                    ProbeOutcome::Healthy => debug!("[HEARTBEAT] Link healthy"),
                    ProbeOutcome::Recovered => info!("[HEARTBEAT] Link recovered"),
                    ProbeOutcome::Failed(_) => {}
                }
            }

            info!("[HEARTBEAT] Monitoring stopped");
        });

        Ok(HeartbeatHandle {
            active: self.active.clone(),
            task,
        })
    }
}

/// Handle to stop heartbeat monitoring
pub struct HeartbeatHandle {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}
