//! Collaborator contracts consumed by the connection manager
//!
//! The negotiate endpoint and the concrete wire transport are external; the
//! manager only relies on the traits below.

use anyhow::Result;
use async_trait::async_trait;
use pulse_shared::codec::RawPayload;
use pulse_shared::Identity;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Short-lived connection parameters issued by the negotiate endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    /// Base URL of the realtime service
    pub endpoint: String,
    pub hub: String,
}

impl Credentials {
    /// Fully-formed connection URL: `{endpoint}/{hub}?access_token={token}`
    pub fn connection_url(&self) -> String {
        format!(
            "{}/{}?access_token={}",
            self.endpoint.trim_end_matches('/'),
            self.hub.trim_matches('/'),
            self.token
        )
    }
}

/// Exchanges ambient credentials for transport connection parameters
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, identity: &Identity) -> Result<Credentials>;
}

/// Events a transport session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(RawPayload),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One underlying socket-like connection
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Perform the handshake; `connected` is reported on the event channel
    async fn start(&self) -> Result<()>;

    /// Close the session; safe to call more than once
    async fn stop(&self);

    async fn join_group(&self, group: &str) -> Result<()>;

    async fn leave_group(&self, group: &str) -> Result<()>;
}

/// A freshly opened, not yet started session and its event stream
pub struct OpenedSession {
    pub session: Arc<dyn TransportSession>,
    pub events: TransportEvents,
}

/// Factory for transport sessions
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Build a session for a fully-formed connection URL
    async fn open(&self, url: &str) -> Result<OpenedSession>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
