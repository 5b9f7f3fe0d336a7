//! Newline-delimited JSON transport over TCP
//!
//! Connection URLs look like `tcp://host:port/<hub>?access_token=<token>`.
//! After connecting the session sends a `hello` frame carrying hub and token;
//! every following line from the server is one inbound message.

use crate::transport::traits::{
    OpenedSession, TransportConnector, TransportEvent, TransportSession,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use pulse_shared::{codec, Message};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Parsed form of a `tcp://` connection URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub address: String,
    pub hub: String,
    pub token: String,
}

impl TcpTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("tcp://")
            .ok_or_else(|| anyhow!("unsupported scheme in {url}"))?;
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (address, hub) = location.split_once('/').unwrap_or((location, ""));
        if address.is_empty() {
            bail!("missing host in {url}");
        }

        let token = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "access_token")
            .map(|(_, value)| value.to_string())
            .unwrap_or_default();

        Ok(Self {
            address: address.to_string(),
            hub: hub.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// TCP session implementing [`TransportSession`]
pub struct TcpSession {
    target: TcpTarget,
    events: mpsc::UnboundedSender<TransportEvent>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSession {
    fn new(target: TcpTarget, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            target,
            events,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    async fn send_frame(&self, message: &Message) -> Result<()> {
        let mut frame = codec::encode(message)?;
        frame.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| anyhow!("session not started"))?;
        writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl TransportSession for TcpSession {
    async fn start(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.target.address)
            .await
            .with_context(|| format!("connecting to {}", self.target.address))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let hello = Message::new(
            "hello",
            json!({ "hub": self.target.hub, "accessToken": self.target.token }),
        );
        self.send_frame(&hello).await?;

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let _ = events.send(TransportEvent::Message(line.into()));
                    }
                    Ok(None) => break "server closed connection".to_string(),
                    Err(e) => break format!("read error: {}", e),
                }
            };
            debug!("TCP reader stopped: {}", reason);
            let _ = events.send(TransportEvent::Disconnected { reason });
        });
        *self.reader.lock().await = Some(reader);

        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn join_group(&self, group: &str) -> Result<()> {
        self.send_frame(&Message::new("joinGroup", json!({ "group": group })))
            .await
    }

    async fn leave_group(&self, group: &str) -> Result<()> {
        self.send_frame(&Message::new("leaveGroup", json!({ "group": group })))
            .await
    }
}

/// TCP connector producing [`TcpSession`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn open(&self, url: &str) -> Result<OpenedSession> {
        let target = TcpTarget::parse(url)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(OpenedSession {
            session: Arc::new(TcpSession::new(target, tx)),
            events: rx,
        })
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let target = TcpTarget::parse("tcp://127.0.0.1:7070/presence?access_token=abc").unwrap();
        assert_eq!(target.address, "127.0.0.1:7070");
        assert_eq!(target.hub, "presence");
        assert_eq!(target.token, "abc");

        assert!(TcpTarget::parse("ws://host/hub").is_err());
        assert!(TcpTarget::parse("tcp:///hub").is_err());
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let hello = lines.next_line().await.unwrap().unwrap();
            let join = lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(b"{\"type\":\"presence\",\"user\":{\"email\":\"bob@x.com\"}}\n")
                .await
                .unwrap();
            (hello, join)
        });

        let url = format!("tcp://{}/presence?access_token=tok", addr);
        let OpenedSession {
            session,
            mut events,
        } = TcpConnector::new().open(&url).await.unwrap();

        session.start().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        session.join_group("alice@x.com").await.unwrap();

        match events.recv().await {
            Some(TransportEvent::Message(raw)) => {
                let msg = codec::decode(&raw).unwrap();
                assert_eq!(msg.kind(), "presence");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let (hello, join) = server.await.unwrap();
        let hello: serde_json::Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["accessToken"], "tok");
        let join: serde_json::Value = serde_json::from_str(&join).unwrap();
        assert_eq!(join, json!({ "type": "joinGroup", "group": "alice@x.com" }));

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        session.stop().await;
    }
}
