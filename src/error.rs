//! Error types surfaced by the connection manager

use thiserror::Error;

/// Outcome error of a connection attempt or group operation.
///
/// `Clone` so that every caller coalesced onto one attempt observes the same
/// outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Credential negotiation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Transport failed to open or never reported `connected`
    #[error("Transport handshake failed: {0}")]
    Handshake(String),

    /// A newer connect, disconnect or cleanup replaced this attempt
    #[error("Connection attempt superseded")]
    Superseded,

    /// Reconnection gave up and handed over to hard recovery
    #[error("Connection escalated to hard recovery")]
    Escalated,

    /// Reconnect requested before any identity was set
    #[error("No identity to connect with")]
    NoIdentity,

    /// Identity or group name is blank after normalization
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// Live join/leave failed; membership is still remembered
    #[error("Group {action} failed for {group}: {message}")]
    GroupOperation {
        action: &'static str,
        group: String,
        message: String,
    },
}

impl ConnectError {
    pub fn negotiation(err: &anyhow::Error) -> Self {
        Self::Negotiation(format!("{:#}", err))
    }

    pub fn handshake(err: &anyhow::Error) -> Self {
        Self::Handshake(format!("{:#}", err))
    }
}

pub type ConnectResult<T> = Result<T, ConnectError>;
