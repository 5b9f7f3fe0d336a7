//! Cancellable delayed tasks
//!
//! Reconnect and escalation timers are owned by the connection manager as
//! [`TimerHandle`]s. Everything runs on `tokio::time`, so tests drive the
//! clock with `#[tokio::test(start_paused = true)]`.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawns delayed tasks on the current tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run `task` after `delay` unless the returned handle is cancelled or dropped first
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TimerHandle {
            task: Some(handle),
            delay,
        }
    }
}

/// A pending delayed task; aborted on [`cancel`](TimerHandle::cancel) or drop
#[derive(Debug)]
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
    delay: Duration,
}

impl TimerHandle {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
