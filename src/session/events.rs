use crate::audio::noise::SuppressionMode;
use crate::session::peer::{PeerId, PeerState};
use crate::signaling::{IceCandidate, ServerMessage, SignalPayload, StatusUpdate};

/// Health and media signals a negotiator reports about its peer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    Connected,
    Disconnected,
    Failed,
    Closed,
    RemoteTrack,
    /// Volume percentage of the peer's incoming audio.
    AudioLevel(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub peer_id: PeerId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Requests from the local user.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    Join { room: String },
    Leave,
    SetMicMuted(bool),
    SetDeafened(bool),
    SetStreaming(bool),
    SetPeerGain { peer_id: PeerId, gain: f32 },
    SetPeerMuted { peer_id: PeerId, muted: bool },
    SetNoiseSuppression(bool),
    SetSuppressionMode(SuppressionMode),
    RestartNoiseProfiling,
    SetSilenceGate { enabled: bool, threshold: u8 },
    /// Registers a foreign-process audio source on the loopback mixer.
    AddLoopbackSource { source_id: String, channels: usize },
    RemoveLoopbackSource { source_id: String },
    /// Little-endian PCM16 from a loopback source.
    PushLoopbackChunk { source_id: String, bytes: Vec<u8> },
    Shutdown,
}

/// Everything the orchestrator consumes, in one ordered stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Signal(ServerMessage),
    Transport(TransportEvent),
    RetryDue(PeerId),
    /// The negotiator of `generation` has had its full time to connect.
    NegotiationDeadline { peer_id: PeerId, generation: u64 },
    Command(LocalCommand),
    SignalingLost,
}

/// Notifications for whatever presents the session to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { room: String },
    Left,
    PeerStateChanged { peer_id: PeerId, state: PeerState },
    /// Reconnection gave up; the peer stays unreachable until it rejoins.
    PeerFailed { peer_id: PeerId, attempts: u32 },
    PeerClosed { peer_id: PeerId },
    SpeakingChanged { peer_id: PeerId, speaking: bool },
    PeerGainChanged { peer_id: PeerId, gain: f32 },
    PeerStatus(StatusUpdate),
    LocalStatus(StatusUpdate),
    SilenceChanged { silent: bool, volume: u8 },
    ScreenShareRequested { peer_id: PeerId },
    ScreenShareStopped { peer_id: PeerId },
    ScreenSignal { sender: PeerId, data: SignalPayload },
    ServerError { message: String },
}
