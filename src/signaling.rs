use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Roster entry as the relay reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_uuid: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `{type, sdp}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Body of `signal` and `screen_signal` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub room: String,
    pub user_uuid: String,
    pub username: String,
    pub is_mic_muted: bool,
    pub is_deafened: bool,
    pub is_streaming: bool,
}

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { room: String },
    Leave {},
    Signal { target: String, data: SignalPayload },
    UserStatusUpdate(StatusUpdate),
    ScreenShareRequest { target: String },
    ScreenShareStop { target: String },
    ScreenSignal { target: String, data: SignalPayload },
    Ping,
    Pong,
}

/// Messages the relay delivers to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { room: String },
    Peers { peers: Vec<PeerInfo> },
    PeerJoined(PeerInfo),
    PeerLeft(PeerInfo),
    Signal { sender: String, data: SignalPayload },
    UserStatusUpdate(StatusUpdate),
    ScreenShareRequest { user_uuid: String },
    ScreenShareStop { user_uuid: String },
    ScreenSignal { sender: String, data: SignalPayload },
    Ping,
    Pong,
    Error { message: String },
}

pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    /// Opens the relay connection. Frames that do not parse as a
    /// [`ServerMessage`] are logged and skipped; the inbound channel closes
    /// when the socket does.
    pub async fn connect(url: &str, keepalive: Duration) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "signaling channel connected");
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(keepalive);
            keepalive.tick().await;
            loop {
                let msg = tokio::select! {
                    msg = outgoing_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = keepalive.tick() => ClientMessage::Ping,
                };
                let json = match encode_client_message(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unserializable signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("signaling read failed: {}", e);
                        break;
                    }
                };
                match decode_server_message(&text) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("ignoring unrecognized signaling frame: {}", e),
                }
            }
            info!("signaling channel closed");
        });

        Ok(Self {
            tx: outgoing_tx,
            rx,
        })
    }

    /// Splits into the outbound queue and the inbound message stream.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::Receiver<ServerMessage>,
    ) {
        (self.tx, self.rx)
    }
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}
