//! Failure escalation
//!
//! When no connection succeeds within a fixed window measured from the first
//! attempt, incremental backoff is abandoned and a hard recovery runs once.

use std::time::Duration;
use tokio::time::Instant;
use tracing::error;

/// Last-resort recovery for a link that cannot be repaired by retrying
pub trait RecoveryAction: Send + Sync {
    fn recover(&self, reason: &str);
}

/// Exit code used by [`ProcessRestart`]; supervisors restart on it
pub const RESTART_EXIT_CODE: i32 = 75;

/// Terminates the process so its supervisor starts a fresh one
#[derive(Debug, Clone, Copy)]
pub struct ProcessRestart {
    exit_code: i32,
}

impl Default for ProcessRestart {
    fn default() -> Self {
        Self {
            exit_code: RESTART_EXIT_CODE,
        }
    }
}

impl ProcessRestart {
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl RecoveryAction for ProcessRestart {
    fn recover(&self, reason: &str) {
        error!(
            "[RECOVERY] Restarting process (exit {}): {}",
            self.exit_code, reason
        );
        std::process::exit(self.exit_code);
    }
}

/// Tracks the escalation window for the current identity
#[derive(Debug, Clone)]
pub struct EscalationTracker {
    window: Duration,
    first_attempt: Option<Instant>,
    fired: bool,
}

impl EscalationTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first_attempt: None,
            fired: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record the first attempt; returns `true` if this call opened the window
    pub fn begin(&mut self, now: Instant) -> bool {
        if self.first_attempt.is_some() {
            return false;
        }
        self.first_attempt = Some(now);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.first_attempt.is_some()
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.first_attempt
            .is_some_and(|first| now.saturating_duration_since(first) >= self.window)
    }

    /// Claim the one escalation allowed per identity session
    pub fn try_fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        self.first_attempt = None;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Connection succeeded: close the window
    pub fn clear(&mut self) {
        self.first_attempt = None;
    }

    /// New identity session
    pub fn reset(&mut self) {
        self.first_attempt = None;
        self.fired = false;
    }
}
