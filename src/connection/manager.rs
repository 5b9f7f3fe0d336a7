//! Connection manager with remembered groups and automatic reconnection

use super::backoff::Backoff;
use super::config::ConnectionConfig;
use super::escalation::{EscalationTracker, RecoveryAction};
use super::groups::GroupMembership;
use crate::error::{ConnectError, ConnectResult};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::subscription::{
    ConnectionDriver, LifecycleCallback, Observers, Subscription, SubscriptionRegistry,
};
use crate::transport::{
    Negotiator, OpenedSession, TransportConnector, TransportEvent, TransportEvents,
    TransportSession,
};
use anyhow::bail;
use futures::future::{BoxFuture, FutureExt, Shared};
use pulse_shared::codec::{self, RawPayload};
use pulse_shared::state_machine::{
    ConnectionState, ConnectionStateMachine, LinkEvent, TransitionResult,
};
use pulse_shared::{GroupName, Identity, Message};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

type SharedOutcome = Shared<BoxFuture<'static, ConnectResult<()>>>;

/// Outcome of the current connect chain (first attempt plus its retries),
/// shared by every caller that coalesced onto it
struct PendingOutcome {
    tx: oneshot::Sender<ConnectResult<()>>,
    outcome: SharedOutcome,
}

impl PendingOutcome {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let outcome = rx
            .map(|result| result.unwrap_or(Err(ConnectError::Superseded)))
            .boxed()
            .shared();
        Self { tx, outcome }
    }

    fn resolve(self, result: ConnectResult<()>) {
        let _ = self.tx.send(result);
    }
}

/// Everything the manager mutates, guarded by one lock that is never held
/// across an await
struct LinkState {
    fsm: ConnectionStateMachine,
    identity: Option<Identity>,
    groups: GroupMembership,
    backoff: Backoff,
    escalation: EscalationTracker,
    session: Option<Arc<dyn TransportSession>>,
    /// Bumped by every attempt and teardown; completions from older epochs are ignored
    epoch: u64,
    reconnect_enabled: bool,
    pending: Option<PendingOutcome>,
    retry_timer: Option<TimerHandle>,
    escalation_timer: Option<TimerHandle>,
}

impl LinkState {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            fsm: ConnectionStateMachine::new(),
            identity: None,
            groups: GroupMembership::new(),
            backoff: Backoff::new(
                config.backoff_floor,
                config.backoff_ceiling,
                config.backoff_jitter,
            ),
            escalation: EscalationTracker::new(config.escalation_window),
            session: None,
            epoch: 0,
            reconnect_enabled: false,
            pending: None,
            retry_timer: None,
            escalation_timer: None,
        }
    }

    fn transition(&mut self, event: LinkEvent) {
        let from = self.fsm.state();
        match self.fsm.process_event(event) {
            TransitionResult::Success(to) if from != to => {
                debug!("[LINK] {} -> {} ({:?})", from, to, event);
            }
            TransitionResult::Success(_) => {}
            TransitionResult::Invalid { from, event } => {
                warn!("[LINK] Ignoring {:?} while {}", event, from);
            }
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.escalation_timer.take() {
            timer.cancel();
        }
    }

    fn resolve_pending(&mut self, result: ConnectResult<()>) {
        if let Some(pending) = self.pending.take() {
            pending.resolve(result);
        }
    }

    /// Session usable for live group operations
    fn live_session(&self) -> Option<Arc<dyn TransportSession>> {
        if self.fsm.is_connected() {
            self.session.clone()
        } else {
            None
        }
    }

    /// Forget everything scoped to the current identity; returns the session to stop
    fn teardown(&mut self) -> Option<Arc<dyn TransportSession>> {
        self.epoch += 1;
        self.cancel_timers();
        self.resolve_pending(Err(ConnectError::Superseded));
        self.reconnect_enabled = false;
        self.identity = None;
        self.groups.clear();
        self.backoff.reset();
        self.escalation.reset();
        self.session.take()
    }
}

enum ConnectPlan {
    AlreadyConnected,
    Await {
        outcome: SharedOutcome,
        stale: Option<Arc<dyn TransportSession>>,
    },
}

struct ManagerInner {
    me: Weak<ManagerInner>,
    config: ConnectionConfig,
    negotiator: Arc<dyn Negotiator>,
    connector: Arc<dyn TransportConnector>,
    recovery: Arc<dyn RecoveryAction>,
    scheduler: Scheduler,
    registry: Arc<SubscriptionRegistry>,
    connected_callbacks: Arc<Observers<LifecycleCallback>>,
    disconnected_callbacks: Arc<Observers<LifecycleCallback>>,
    state: Mutex<LinkState>,
}

/// Owns the single realtime connection of this process.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until [`connect`](Self::connect)
    pub fn new(
        config: ConnectionConfig,
        negotiator: Arc<dyn Negotiator>,
        connector: Arc<dyn TransportConnector>,
        recovery: Arc<dyn RecoveryAction>,
    ) -> Self {
        let registry = SubscriptionRegistry::new();
        let inner = Arc::new_cyclic(|me: &Weak<ManagerInner>| {
            let driver: Weak<dyn ConnectionDriver> = me.clone();
            registry.attach_driver(driver);
            ManagerInner {
                me: me.clone(),
                state: Mutex::new(LinkState::new(&config)),
                config,
                negotiator,
                connector,
                recovery,
                scheduler: Scheduler::new(),
                registry: registry.clone(),
                connected_callbacks: Arc::new(Observers::new()),
                disconnected_callbacks: Arc::new(Observers::new()),
            }
        });
        Self { inner }
    }

    /// Connect as `identity`.
    ///
    /// Returns immediately when already connected as the same identity and
    /// joins the in-flight attempt when one is running. A different identity
    /// tears the current connection down first. Resolves once connected, or
    /// with the error that ended the attempt chain (escalation, supersession).
    pub async fn connect(&self, identity: &str) -> ConnectResult<()> {
        let identity =
            Identity::parse(identity).ok_or_else(|| ConnectError::InvalidName(identity.into()))?;

        match self.inner.plan_connect(identity) {
            ConnectPlan::AlreadyConnected => Ok(()),
            ConnectPlan::Await { outcome, stale } => {
                if let Some(session) = stale {
                    session.stop().await;
                }
                outcome.await
            }
        }
    }

    /// Drop the current session and start over with the remembered identity
    pub async fn reconnect(&self) -> ConnectResult<()> {
        let (outcome, stale) = {
            let mut st = self.inner.lock_state();
            let identity = st.identity.clone().ok_or(ConnectError::NoIdentity)?;
            info!("[LINK] Reconnect requested for {}", identity);
            st.reconnect_enabled = true;
            st.backoff.reset();
            self.inner.start_attempt(&mut st, identity)
        };
        if let Some(session) = stale {
            session.stop().await;
        }
        outcome.await
    }

    /// Stop the connection and forget the identity and its groups.
    ///
    /// Subscriptions stay registered so a later `connect` needs no re-subscribe.
    pub async fn disconnect(&self) {
        let (session, was_connected) = {
            let mut st = self.inner.lock_state();
            let was_connected = st.fsm.is_connected();
            let session = st.teardown();
            st.transition(LinkEvent::Closed);
            (session, was_connected)
        };

        if let Some(session) = session {
            session.stop().await;
        }
        if was_connected {
            self.inner.disconnected_callbacks.notify("DISCONNECTED");
        }
        info!("[LINK] Disconnected");
    }

    /// Leave every remembered group (best effort), stop the transport and
    /// reset all connection state
    pub async fn force_cleanup(&self) {
        let (session, groups) = {
            let mut st = self.inner.lock_state();
            let groups = st.groups.snapshot();
            let session = st.teardown();
            st.transition(LinkEvent::Reset);
            (session, groups)
        };

        if let Some(session) = session {
            for group in &groups {
                if let Err(e) = session.leave_group(group.as_str()).await {
                    debug!("[LINK] Cleanup could not leave {}: {:#}", group, e);
                }
            }
            session.stop().await;
        }
        info!("[LINK] Forced cleanup complete");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().fsm.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().fsm.state()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.lock_state().identity.clone()
    }

    /// Remembered groups, sorted
    pub fn groups(&self) -> Vec<GroupName> {
        self.inner.lock_state().groups.snapshot()
    }

    /// Remember `name` and join it now if connected
    pub async fn join_group(&self, name: &str) -> ConnectResult<()> {
        let group = GroupName::parse(name).ok_or_else(|| ConnectError::InvalidName(name.into()))?;
        let live = {
            let mut st = self.inner.lock_state();
            st.groups.insert(group.clone());
            st.live_session()
        };

        if let Some(session) = live {
            session
                .join_group(group.as_str())
                .await
                .map_err(|e| ConnectError::GroupOperation {
                    action: "join",
                    group: group.to_string(),
                    message: format!("{:#}", e),
                })?;
        }
        Ok(())
    }

    /// Forget `name` and leave it now if connected
    pub async fn leave_group(&self, name: &str) -> ConnectResult<()> {
        let group = GroupName::parse(name).ok_or_else(|| ConnectError::InvalidName(name.into()))?;
        let live = {
            let mut st = self.inner.lock_state();
            st.groups.remove(&group);
            st.live_session()
        };

        if let Some(session) = live {
            session
                .leave_group(group.as_str())
                .await
                .map_err(|e| ConnectError::GroupOperation {
                    action: "leave",
                    group: group.to_string(),
                    message: format!("{:#}", e),
                })?;
        }
        Ok(())
    }

    /// Called after every successful connection, once all groups were attempted
    pub fn on_connected<F>(&self, callback: F) -> Subscription
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.connected_callbacks.register(Arc::new(callback))
    }

    /// Called whenever an open connection goes away
    pub fn on_disconnected<F>(&self, callback: F) -> Subscription
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.disconnected_callbacks.register(Arc::new(callback))
    }

    /// Receive every decoded inbound message regardless of type
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_all(handler)
    }

    /// Registry inbound messages are fanned out to
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl ManagerInner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock_state().epoch == epoch
    }

    /// `group` is still remembered and `epoch` still owns the link
    fn still_member(&self, epoch: u64, group: &GroupName) -> bool {
        let st = self.lock_state();
        st.epoch == epoch && st.groups.contains(group)
    }

    fn ensure_current(&self, epoch: u64) -> ConnectResult<()> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(ConnectError::Superseded)
        }
    }

    fn plan_connect(self: &Arc<Self>, identity: Identity) -> ConnectPlan {
        let mut st = self.lock_state();

        if st.identity.as_ref() == Some(&identity) {
            if st.fsm.is_connected() {
                debug!("[LINK] Already connected as {}", identity);
                return ConnectPlan::AlreadyConnected;
            }
            if let Some(pending) = &st.pending {
                debug!("[LINK] Joining in-flight connect for {}", identity);
                return ConnectPlan::Await {
                    outcome: pending.outcome.clone(),
                    stale: None,
                };
            }
        }

        let mut stale = None;
        if let Some(current) = st.identity.clone() {
            if current != identity {
                info!("[LINK] Identity changed {} -> {}, tearing down", current, identity);
                stale = st.teardown();
            }
        }

        st.identity = Some(identity.clone());
        st.reconnect_enabled = true;
        st.groups.insert(identity.personal_group());
        if let Some(broadcast) = GroupName::parse(&self.config.broadcast_group) {
            st.groups.insert(broadcast);
        }

        let (outcome, previous) = self.start_attempt(&mut st, identity);
        ConnectPlan::Await {
            outcome,
            stale: stale.or(previous),
        }
    }

    /// Begin a new attempt under a fresh epoch. Returns the chain outcome and
    /// any session the attempt replaces.
    fn start_attempt(
        self: &Arc<Self>,
        st: &mut LinkState,
        identity: Identity,
    ) -> (SharedOutcome, Option<Arc<dyn TransportSession>>) {
        st.epoch += 1;
        let epoch = st.epoch;
        if let Some(timer) = st.retry_timer.take() {
            timer.cancel();
        }
        let previous = st.session.take();
        st.transition(LinkEvent::AttemptStarted);
        self.arm_escalation(st);

        let outcome = st
            .pending
            .get_or_insert_with(PendingOutcome::new)
            .outcome
            .clone();

        tokio::spawn(Arc::clone(self).run_attempt(epoch, identity));
        (outcome, previous)
    }

    /// Open the escalation window if this is the first attempt since the last success
    fn arm_escalation(&self, st: &mut LinkState) {
        if !st.escalation.begin(Instant::now()) {
            return;
        }
        let weak = self.me.clone();
        st.escalation_timer = Some(self.scheduler.schedule(st.escalation.window(), async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_escalation_timer();
            }
        }));
    }

    async fn run_attempt(self: Arc<Self>, epoch: u64, identity: Identity) {
        match self.open_session(epoch, &identity).await {
            Ok(events) => {
                let weak = Arc::downgrade(&self);
                drop(self);
                pump_events(weak, epoch, events).await;
            }
            Err(ConnectError::Superseded) => {
                debug!("[LINK] Attempt {} for {} superseded", epoch, identity);
            }
            Err(err) => self.handle_attempt_failure(epoch, err),
        }
    }

    /// negotiate -> open -> handshake -> rejoin + notify
    async fn open_session(
        self: &Arc<Self>,
        epoch: u64,
        identity: &Identity,
    ) -> ConnectResult<TransportEvents> {
        debug!("[LINK] Attempt {} connecting as {}", epoch, identity);

        let credentials = self
            .negotiator
            .negotiate(identity)
            .await
            .map_err(|e| ConnectError::negotiation(&e))?;
        self.ensure_current(epoch)?;

        let OpenedSession {
            session,
            mut events,
        } = self
            .connector
            .open(&credentials.connection_url())
            .await
            .map_err(|e| ConnectError::handshake(&e))?;

        if !self.install_session(epoch, &session) {
            session.stop().await;
            return Err(ConnectError::Superseded);
        }

        let handshake = timeout(
            self.config.handshake_timeout,
            self.await_handshake(&session, &mut events),
        )
        .await;
        let result = match handshake {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::handshake(&e)),
            Err(_) => Err(ConnectError::Handshake(format!(
                "{} transport not connected within {:?}",
                self.connector.name(),
                self.config.handshake_timeout
            ))),
        };
        if let Err(err) = result {
            self.release_session(epoch);
            session.stop().await;
            return Err(err);
        }

        self.handle_connected(epoch).await;
        Ok(events)
    }

    async fn await_handshake(
        &self,
        session: &Arc<dyn TransportSession>,
        events: &mut TransportEvents,
    ) -> anyhow::Result<()> {
        session.start().await?;
        loop {
            match events.recv().await {
                Some(TransportEvent::Connected) => return Ok(()),
                Some(TransportEvent::Message(raw)) => self.ingest(&raw),
                Some(TransportEvent::Disconnected { reason }) => {
                    bail!("closed during handshake: {}", reason)
                }
                None => bail!("event stream closed during handshake"),
            }
        }
    }

    fn install_session(&self, epoch: u64, session: &Arc<dyn TransportSession>) -> bool {
        let mut st = self.lock_state();
        if st.epoch != epoch {
            return false;
        }
        st.session = Some(Arc::clone(session));
        true
    }

    fn release_session(&self, epoch: u64) {
        let mut st = self.lock_state();
        if st.epoch == epoch {
            st.session = None;
        }
    }

    /// Transport reported `connected` for `epoch`
    async fn handle_connected(&self, epoch: u64) {
        let (identity, session, groups, pending) = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                return;
            }
            let (Some(identity), Some(session)) = (st.identity.clone(), st.session.clone()) else {
                return;
            };
            st.transition(LinkEvent::Established);
            st.backoff.reset();
            st.escalation.clear();
            st.cancel_timers();
            (identity, session, st.groups.snapshot(), st.pending.take())
        };

        info!(
            "[LINK] Connected as {} via {}, rejoining {} group(s)",
            identity,
            self.connector.name(),
            groups.len()
        );
        for group in &groups {
            if !self.still_member(epoch, group) {
                debug!("[LINK] Skipping rejoin of {}, no longer remembered", group);
                continue;
            }
            if let Err(e) = session.join_group(group.as_str()).await {
                warn!("[LINK] Failed to rejoin {}: {:#}", group, e);
                continue;
            }
            // A leave that landed while the join was in flight
            if self.is_current(epoch) && !self.still_member(epoch, group) {
                if let Err(e) = session.leave_group(group.as_str()).await {
                    warn!("[LINK] Failed to leave {} after rejoin: {:#}", group, e);
                }
            }
        }

        self.connected_callbacks.notify("CONNECTED");

        if let Some(pending) = pending {
            if self.is_current(epoch) {
                pending.resolve(Ok(()));
            } else {
                pending.resolve(Err(ConnectError::Superseded));
            }
        }
    }

    /// Open connection for `epoch` went away
    fn handle_drop(self: &Arc<Self>, epoch: u64, reason: &str) {
        let session = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                return;
            }
            warn!("[LINK] Connection lost: {}", reason);
            st.transition(LinkEvent::Dropped);
            st.session.take()
        };

        if let Some(session) = session {
            tokio::spawn(async move { session.stop().await });
        }
        self.disconnected_callbacks.notify("DISCONNECTED");

        // Callbacks may have reconnected or disconnected in the meantime
        let escalation = {
            let mut st = self.lock_state();
            if st.epoch != epoch || st.fsm.state() != ConnectionState::Disconnected {
                return;
            }
            self.schedule_recovery(&mut st, reason)
        };
        if let Some(reason) = escalation {
            self.recovery.recover(&reason);
        }
    }

    fn handle_attempt_failure(self: &Arc<Self>, epoch: u64, err: ConnectError) {
        let escalation = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                return;
            }
            warn!("[LINK] Connection attempt failed: {}", err);
            st.session = None;
            st.transition(LinkEvent::AttemptFailed);
            if !st.reconnect_enabled {
                st.resolve_pending(Err(err));
                return;
            }
            self.schedule_recovery(&mut st, &err.to_string())
        };

        if let Some(reason) = escalation {
            self.recovery.recover(&reason);
        }
    }

    /// Schedule the next retry, or close the link when the escalation window
    /// has passed. Returns the escalation reason if recovery must run.
    fn schedule_recovery(&self, st: &mut LinkState, reason: &str) -> Option<String> {
        if !st.reconnect_enabled {
            return None;
        }

        let now = Instant::now();
        self.arm_escalation(st);
        if st.escalation.is_overdue(now) && st.escalation.try_fire() {
            return Some(self.close_for_escalation(st, reason));
        }

        let delay = st.backoff.next_delay();
        st.transition(LinkEvent::RetryScheduled);
        info!(
            "[LINK] Reconnecting in {:?} (failure #{})",
            delay,
            st.backoff.failures()
        );

        let weak = self.me.clone();
        let epoch = st.epoch;
        st.retry_timer = Some(self.scheduler.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_retry_timer(epoch);
            }
        }));
        None
    }

    fn close_for_escalation(&self, st: &mut LinkState, reason: &str) -> String {
        st.epoch += 1;
        st.cancel_timers();
        st.reconnect_enabled = false;
        if let Some(session) = st.session.take() {
            tokio::spawn(async move { session.stop().await });
        }
        st.transition(LinkEvent::Closed);
        st.resolve_pending(Err(ConnectError::Escalated));

        let reason = format!(
            "no connection within {:?} (last error: {})",
            st.escalation.window(),
            reason
        );
        error!("[LINK] Escalating to hard recovery: {}", reason);
        reason
    }

    fn on_retry_timer(self: &Arc<Self>, epoch: u64) {
        let stale = {
            let mut st = self.lock_state();
            if st.epoch != epoch || !st.reconnect_enabled || st.fsm.is_connected() {
                return;
            }
            let Some(identity) = st.identity.clone() else {
                return;
            };
            let (_, stale) = self.start_attempt(&mut st, identity);
            stale
        };

        if let Some(session) = stale {
            tokio::spawn(async move { session.stop().await });
        }
    }

    fn on_escalation_timer(&self) {
        let reason = {
            let mut st = self.lock_state();
            st.escalation_timer = None;
            if st.fsm.is_connected() || !st.reconnect_enabled {
                return;
            }
            if !st.escalation.is_overdue(Instant::now()) || !st.escalation.try_fire() {
                return;
            }
            self.close_for_escalation(&mut st, "escalation window elapsed")
        };
        self.recovery.recover(&reason);
    }

    /// Decode and fan out one inbound frame; undecodable frames are dropped
    fn ingest(&self, raw: &RawPayload) {
        match codec::decode(raw) {
            Ok(message) => {
                self.registry.dispatch(&message);
            }
            Err(e) => debug!("[LINK] Dropping undecodable frame: {}", e),
        }
    }
}

impl ConnectionDriver for ManagerInner {
    fn ensure_connected(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let stale = {
            let mut st = self.lock_state();
            if st.fsm.is_connected() || st.pending.is_some() {
                return;
            }
            let Some(identity) = st.identity.clone() else {
                return;
            };
            debug!("[LINK] Subscriber waiting; reconnecting as {}", identity);
            st.reconnect_enabled = true;
            let (_, stale) = me.start_attempt(&mut st, identity);
            stale
        };

        if let Some(session) = stale {
            tokio::spawn(async move { session.stop().await });
        }
    }
}

/// Forward transport events for `epoch` until the session closes or is superseded
async fn pump_events(inner: Weak<ManagerInner>, epoch: u64, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.is_current(epoch) {
            debug!("[LINK] Session for attempt {} superseded", epoch);
            return;
        }
        match event {
            TransportEvent::Connected => inner.handle_connected(epoch).await,
            TransportEvent::Message(raw) => inner.ingest(&raw),
            TransportEvent::Disconnected { reason } => {
                inner.handle_drop(epoch, &reason);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_drop(epoch, "transport event stream closed");
    }
}
