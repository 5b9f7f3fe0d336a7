//! In-memory collaborators for exercising the connection manager

use crate::connection::{ConnectionConfig, RecoveryAction};
use crate::transport::{
    Credentials, Negotiator, OpenedSession, TransportConnector, TransportEvent, TransportSession,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use pulse_shared::Identity;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Deterministic timings: no jitter, short windows
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        backoff_floor: Duration::from_secs(1),
        backoff_ceiling: Duration::from_secs(8),
        backoff_jitter: Duration::ZERO,
        handshake_timeout: Duration::from_secs(5),
        escalation_window: Duration::from_secs(60),
        ..ConnectionConfig::default()
    }
}

/// Poll `condition` every millisecond; panics after 30s of (possibly virtual) time
pub async fn wait_until(condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), poll)
        .await
        .expect("condition not reached within 30s");
}

#[derive(Default)]
pub struct MockNegotiator {
    calls: AtomicUsize,
    delay: Option<Duration>,
    fail_remaining: AtomicUsize,
    always_fail: AtomicBool,
}

impl MockNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(failures),
            ..Self::default()
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            always_fail: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn negotiate(&self, identity: &Identity) -> Result<Credentials> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail.load(Ordering::SeqCst) {
            bail!("negotiate rejected {}", identity);
        }
        let scripted = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            bail!("negotiate unavailable (call {})", call);
        }
        Ok(Credentials {
            token: format!("token-{}", call),
            endpoint: "mock://realtime".into(),
            hub: "presence".into(),
        })
    }
}

/// Session driven by the test through [`emit`](MockSession::emit)
pub struct MockSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    auto_connect: bool,
    failing_joins: Vec<String>,
    join_delay: Option<Duration>,
    joined: Mutex<Vec<String>>,
    left: Mutex<Vec<String>>,
    members: Mutex<BTreeSet<String>>,
    stopped: AtomicBool,
}

impl MockSession {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Groups joined, in order
    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().unwrap().clone()
    }

    pub fn joined_set(&self) -> BTreeSet<String> {
        self.joined().into_iter().collect()
    }

    pub fn left(&self) -> Vec<String> {
        self.left.lock().unwrap().clone()
    }

    /// Groups the session is in right now, after every join and leave
    pub fn members(&self) -> BTreeSet<String> {
        self.members.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn start(&self) -> Result<()> {
        if self.auto_connect {
            self.emit(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn join_group(&self, group: &str) -> Result<()> {
        if self.failing_joins.iter().any(|g| g == group) {
            bail!("server refused join for {}", group);
        }
        if let Some(delay) = self.join_delay {
            tokio::time::sleep(delay).await;
        }
        self.joined.lock().unwrap().push(group.to_string());
        self.members.lock().unwrap().insert(group.to_string());
        Ok(())
    }

    async fn leave_group(&self, group: &str) -> Result<()> {
        self.left.lock().unwrap().push(group.to_string());
        self.members.lock().unwrap().remove(group);
        Ok(())
    }
}

/// Records every opened session; auto-connecting unless built with [`manual`](MockConnector::manual)
#[derive(Default)]
pub struct MockConnector {
    auto_connect: bool,
    failing_joins: Vec<String>,
    join_delay: Option<Duration>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            ..Self::default()
        })
    }

    /// Sessions only report `connected` when the test emits it
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_failing_joins(groups: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            failing_joins: groups.iter().map(|g| g.to_string()).collect(),
            ..Self::default()
        })
    }

    /// Every live join takes `delay` to complete
    pub fn with_join_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            join_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn opened(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self, url: &str) -> Result<OpenedSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession {
            events: tx,
            auto_connect: self.auto_connect,
            failing_joins: self.failing_joins.clone(),
            join_delay: self.join_delay,
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            members: Mutex::new(BTreeSet::new()),
            stopped: AtomicBool::new(false),
        });
        self.urls.lock().unwrap().push(url.to_string());
        self.sessions.lock().unwrap().push(session.clone());
        Ok(OpenedSession {
            session,
            events: rx,
        })
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}

#[derive(Default)]
pub struct CountingRecovery {
    reasons: Mutex<Vec<String>>,
}

impl CountingRecovery {
    pub fn count(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }
}

impl RecoveryAction for CountingRecovery {
    fn recover(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}
