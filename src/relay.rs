//! Relay connection supervisor.
//!
//! The orchestrator writes to one outbound queue for its whole life. This
//! module bridges that queue to whichever relay connection is live, reports
//! a lost connection to the orchestrator, reconnects with a bounded number of
//! attempts and joins the room again on every new connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::{AppError, Result};
use crate::session::events::{LocalCommand, SessionInput};
use crate::signaling::{ClientMessage, ServerMessage, SignalingClient};

pub type RelayChannels = (
    mpsc::UnboundedSender<ClientMessage>,
    mpsc::Receiver<ServerMessage>,
);

/// Opens one relay connection.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<RelayChannels>;
}

pub struct WsRelayConnector {
    url: String,
    keepalive: Duration,
}

impl WsRelayConnector {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            keepalive: config.keepalive_interval(),
        }
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self) -> Result<RelayChannels> {
        let client = SignalingClient::connect(&self.url, self.keepalive).await?;
        Ok(client.into_parts())
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub room: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&SignalingConfig> for RelaySettings {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            room: config.room.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

enum Pump {
    /// The relay went away; try another connection.
    Lost,
    /// The orchestrator is gone; nothing left to relay.
    Finished,
}

/// Runs until the orchestrator drops its outbound queue (`Ok`) or the relay
/// stays unreachable for `max_reconnect_attempts` consecutive attempts.
pub async fn run_relay<C: RelayConnector>(
    connector: C,
    settings: RelaySettings,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbox: mpsc::UnboundedSender<SessionInput>,
) -> Result<()> {
    let mut failures: u32 = 0;
    let mut first = true;

    loop {
        if !first && !wait_for_retry(&mut outbound, settings.reconnect_delay).await {
            return Ok(());
        }
        first = false;

        let (to_relay, from_relay) = match connector.connect().await {
            Ok(channels) => channels,
            Err(e) => {
                failures += 1;
                warn!(
                    attempt = failures,
                    max_attempts = settings.max_reconnect_attempts,
                    "relay connection failed: {}",
                    e
                );
                if failures >= settings.max_reconnect_attempts {
                    return Err(AppError::Signaling(format!(
                        "relay unreachable after {} attempts",
                        failures
                    )));
                }
                continue;
            }
        };
        failures = 0;

        info!(room = %settings.room, "relay connected, joining");
        let join = SessionInput::Command(LocalCommand::Join {
            room: settings.room.clone(),
        });
        if inbox.send(join).is_err() {
            return Ok(());
        }

        match pump(&mut outbound, to_relay, from_relay, &inbox).await {
            Pump::Finished => return Ok(()),
            Pump::Lost => {
                warn!("relay connection lost");
                if inbox.send(SessionInput::SignalingLost).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn pump(
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    to_relay: mpsc::UnboundedSender<ClientMessage>,
    mut from_relay: mpsc::Receiver<ServerMessage>,
    inbox: &mpsc::UnboundedSender<SessionInput>,
) -> Pump {
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if to_relay.send(message).is_err() {
                        return Pump::Lost;
                    }
                }
                None => return Pump::Finished,
            },
            message = from_relay.recv() => match message {
                Some(message) => {
                    if inbox.send(SessionInput::Signal(message)).is_err() {
                        return Pump::Finished;
                    }
                }
                None => return Pump::Lost,
            },
        }
    }
}

/// Sleeps for `delay`, discarding anything the orchestrator queues for the
/// dead connection. Returns false if the queue closes meanwhile.
async fn wait_for_retry(
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            message = outbound.recv() => match message {
                Some(message) => debug!(?message, "relay offline, message dropped"),
                None => return false,
            },
        }
    }
}
