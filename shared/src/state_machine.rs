//! Connection State Machine
//!
//! Defines the lifecycle states of the realtime link and the valid
//! transitions between them.

use std::fmt;

/// Lifecycle state of the realtime link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt (negotiate + open) began
    AttemptStarted,
    /// Transport reported `connected`
    Established,
    /// Negotiation or handshake failed
    AttemptFailed,
    /// Transport closed after having been open
    Dropped,
    /// A retry has been scheduled after a failure or drop
    RetryScheduled,
    /// Explicit disconnect or escalation
    Closed,
    /// Full reset of the manager
    Reset,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed (or stayed the same)
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The lifecycle state machine for one realtime link
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn is_connected(&self) -> bool {
        self.current_state == ConnectionState::Connected
    }

    /// An attempt is running or a retry is pending
    pub fn is_pending(&self) -> bool {
        matches!(
            self.current_state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        // Explicit close and reset always win
        match event {
            LinkEvent::Closed => {
                self.current_state = ConnectionState::Disconnected;
                return TransitionResult::Success(self.current_state);
            }
            LinkEvent::Reset => {
                self.current_state = ConnectionState::Idle;
                return TransitionResult::Success(self.current_state);
            }
            _ => {}
        }

        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.current_state, event) {
            // Fresh attempts
            (Idle | Disconnected | Connecting, AttemptStarted) => Some(Connecting),

            // Retries and forced reconnects
            (Reconnecting | Connected, AttemptStarted) => Some(Reconnecting),

            // Transport reported connected (again, for transports that heal themselves)
            (Connecting | Reconnecting | Connected, Established) => Some(Connected),

            (Connecting | Reconnecting, AttemptFailed) => Some(Disconnected),
            (Connected, Dropped) => Some(Disconnected),

            (Disconnected, RetryScheduled) => Some(Reconnecting),

            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Explicit disconnect and reset are reachable from anywhere
        (_, Disconnected) | (_, Idle) => true,

        (Idle | Disconnected, Connecting) => true,
        (Connecting | Reconnecting, Connected) => true,
        (Disconnected | Connected, Reconnecting) => true,

        _ => false,
    }
}
