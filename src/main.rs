use anyhow::{Context, Result};
use pulse_link::connection::{ConnectionConfig, ConnectionManager, ProcessRestart};
use pulse_link::global;
use pulse_link::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use pulse_link::transport::{Credentials, StaticNegotiator, TcpConnector};
use pulse_shared::contracts::{kinds, ChatNotification, PresenceUpdate};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let identity = std::env::var("PULSE_IDENTITY").context("PULSE_IDENTITY must be set")?;
    let config = ConnectionConfig::from_env()?;
    let credentials = Credentials {
        token: env_or("PULSE_TOKEN", ""),
        endpoint: env_or("PULSE_ENDPOINT", "tcp://127.0.0.1:7070"),
        hub: env_or("PULSE_HUB", "presence"),
    };

    info!("Realtime client starting: {}", identity);
    info!("  Endpoint: {}/{}", credentials.endpoint, credentials.hub);

    let manager = ConnectionManager::new(
        config,
        Arc::new(StaticNegotiator::new(credentials)),
        Arc::new(TcpConnector::new()),
        Arc::new(ProcessRestart::default()),
    );
    if global::install(manager.clone()).is_err() {
        warn!("A connection manager was already installed");
    }

    let _connected = manager.on_connected(|| {
        info!("Link up");
        Ok(())
    });
    let _disconnected = manager.on_disconnected(|| {
        warn!("Link down, reconnecting");
        Ok(())
    });

    let registry = manager.registry();
    let _presence = registry.subscribe(kinds::PRESENCE, |msg| {
        let update: PresenceUpdate = msg.decode_as()?;
        info!("Presence: {} is {:?}", update.user.email, update.user.status);
        Ok(())
    });
    let _chat = registry.subscribe(kinds::CHAT_NOTIFICATION, |msg| {
        let note: ChatNotification = msg.decode_as()?;
        info!("Chat {} from {}: {}", note.chat_id, note.from, note.preview);
        Ok(())
    });

    let mut heartbeat_config = HeartbeatConfig::from_env()?;
    heartbeat_config.groups.push(format!("commands:{}", identity));
    let heartbeat = HeartbeatMonitor::new(manager.clone(), identity.clone(), heartbeat_config);
    let heartbeat_handle = heartbeat.start()?;
    info!("Heartbeat monitor started");

    let connector = manager.clone();
    let initial = identity.clone();
    tokio::spawn(async move {
        match connector.connect(&initial).await {
            Ok(()) => {
                if let Err(e) = connector.join_group(&format!("commands:{}", initial)).await {
                    warn!("Failed to join command group: {}", e);
                }
            }
            Err(e) => error!("Initial connect failed: {}", e),
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    heartbeat_handle.stop();
    manager.disconnect().await;
    Ok(())
}
