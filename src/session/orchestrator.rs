//! Peer session orchestrator.
//!
//! One task owns every registry (room membership, peer sessions, retry
//! records, playback controls) and consumes a single [`SessionInput`] inbox.
//! Handlers run to completion one at a time, so events for a peer are applied
//! in the order they were received.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::mixer::MixerHandle;
use crate::audio::noise::SuppressionMode;
use crate::audio::pipeline::{PipelineCommand, PipelineHandle};
use crate::audio::playback::{clamp_gain, PlaybackControl, VolumeStore};
use crate::config::ClientConfig;
use crate::error::{AppError, Result};
use crate::room::RoomState;
use crate::session::events::{
    LocalCommand, SessionEvent, SessionInput, TransportEvent, TransportEventKind,
};
use crate::session::negotiator::{Negotiator, NegotiatorContext, NegotiatorFactory};
use crate::session::peer::{
    NegotiationRole, PeerId, PeerSession, PeerState, RolePolicy, RosterOrigin,
};
use crate::session::retry::{RetryDecision, RetryManager, RetryPolicy};
use crate::signaling::{
    ClientMessage, IceCandidate, PeerInfo, ServerMessage, SessionDescription, SignalPayload,
    StatusUpdate,
};

/// Candidates kept per sender while no session exists for it.
pub const MAX_EARLY_CANDIDATES: usize = 64;

/// Distinct unknown senders whose candidates are kept.
pub const MAX_EARLY_SENDERS: usize = 32;

/// The local user's broadcast state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub is_mic_muted: bool,
    pub is_deafened: bool,
    pub is_streaming: bool,
}

pub struct Orchestrator {
    local: PeerInfo,
    role_policy: RolePolicy,
    negotiation_timeout: Duration,
    speaking_threshold: u8,
    room: RoomState,
    peers: HashMap<PeerId, PeerSession>,
    retries: RetryManager,
    playback: HashMap<PeerId, PlaybackControl>,
    volumes: VolumeStore,
    early_candidates: HashMap<PeerId, Vec<IceCandidate>>,
    status: SessionStatus,
    factory: Arc<dyn NegotiatorFactory>,
    pipeline: Option<PipelineHandle>,
    loopback: Option<MixerHandle>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    inbox_rx: mpsc::UnboundedReceiver<SessionInput>,
    next_generation: u64,
}

impl Orchestrator {
    pub fn new(
        config: &ClientConfig,
        local: PeerInfo,
        factory: Arc<dyn NegotiatorFactory>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let volumes = match &config.playback.volumes_path {
            Some(path) => VolumeStore::open(path.clone()),
            None => VolumeStore::in_memory(),
        };
        Self {
            local,
            role_policy: config.negotiation.role_policy,
            negotiation_timeout: config.negotiation.timeout(),
            speaking_threshold: config.playback.speaking_threshold,
            room: RoomState::new(),
            peers: HashMap::new(),
            retries: RetryManager::new(RetryPolicy::from(&config.retry), inbox_tx.clone()),
            playback: HashMap::new(),
            volumes,
            early_candidates: HashMap::new(),
            status: SessionStatus::default(),
            factory,
            pipeline: None,
            loopback: None,
            outbound,
            events,
            inbox_tx,
            inbox_rx,
            next_generation: 0,
        }
    }

    /// Routes mute state and audio settings to the publish pipeline.
    pub fn with_pipeline(mut self, pipeline: PipelineHandle) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Routes loopback source commands to the mixer whose output is
    /// published as the second outbound track.
    pub fn with_loopback(mut self, loopback: MixerHandle) -> Self {
        self.loopback = Some(loopback);
        self
    }

    /// Sender for everything the orchestrator should process.
    pub fn handle(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.inbox_tx.clone()
    }

    pub async fn next_input(&mut self) -> Option<SessionInput> {
        self.inbox_rx.recv().await
    }

    /// Processes the inbox until [`LocalCommand::Shutdown`], then leaves the
    /// room and releases every peer.
    pub async fn run(mut self) {
        info!(user_uuid = %self.local.user_uuid, "session orchestrator started");
        while let Some(input) = self.inbox_rx.recv().await {
            if !self.dispatch(input).await {
                break;
            }
        }
        self.leave_room().await;
        info!("session orchestrator stopped");
    }

    /// Handles one input. Returns false when the orchestrator should stop.
    pub async fn dispatch(&mut self, input: SessionInput) -> bool {
        match input {
            SessionInput::Signal(message) => self.on_server_message(message).await,
            SessionInput::Transport(event) => self.on_transport_event(event).await,
            SessionInput::RetryDue(peer_id) => self.on_retry_due(&peer_id).await,
            SessionInput::NegotiationDeadline {
                peer_id,
                generation,
            } => self.on_negotiation_deadline(&peer_id, generation).await,
            SessionInput::Command(LocalCommand::Shutdown) => return false,
            SessionInput::Command(command) => self.on_command(command).await,
            SessionInput::SignalingLost => {
                warn!("signaling channel lost, closing every peer");
                let was_joined = self.room.is_joined();
                self.teardown().await;
                if was_joined {
                    self.emit(SessionEvent::Left);
                }
            }
        }
        true
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Joined { room } => {
                info!(room = %room, "joined room");
                self.room.enter(&room);
                self.emit(SessionEvent::Joined { room });
                self.publish_status();
            }
            ServerMessage::Peers { peers } => self.on_roster_snapshot(peers).await,
            ServerMessage::PeerJoined(peer) => self.on_peer_joined(peer).await,
            ServerMessage::PeerLeft(peer) => self.on_peer_left(&peer.user_uuid).await,
            ServerMessage::Signal { sender, data } => self.on_signal_message(&sender, data).await,
            ServerMessage::UserStatusUpdate(status) => {
                if status.user_uuid != self.local.user_uuid {
                    self.emit(SessionEvent::PeerStatus(status));
                }
            }
            ServerMessage::ScreenShareRequest { user_uuid } => {
                self.emit(SessionEvent::ScreenShareRequested { peer_id: user_uuid })
            }
            ServerMessage::ScreenShareStop { user_uuid } => {
                self.emit(SessionEvent::ScreenShareStopped { peer_id: user_uuid })
            }
            ServerMessage::ScreenSignal { sender, data } => {
                self.emit(SessionEvent::ScreenSignal { sender, data })
            }
            ServerMessage::Ping => self.send(ClientMessage::Pong),
            ServerMessage::Pong => debug!("keepalive acknowledged"),
            ServerMessage::Error { message } => {
                warn!(message = %message, "relay reported an error");
                self.emit(SessionEvent::ServerError { message });
            }
        }
    }

    pub async fn on_roster_snapshot(&mut self, peers: Vec<PeerInfo>) {
        info!(count = peers.len(), "roster snapshot");
        let listed: HashSet<&str> = peers.iter().map(|p| p.user_uuid.as_str()).collect();
        self.early_candidates.retain(|sender, buffered| {
            let keep = listed.contains(sender.as_str());
            if !keep {
                debug!(peer_id = %sender, count = buffered.len(), "dropping candidates from absent sender");
            }
            keep
        });
        for peer in peers {
            if peer.user_uuid == self.local.user_uuid {
                continue;
            }
            let peer_id = peer.user_uuid.clone();
            self.room.add_member(peer.clone());
            if self.peers.contains_key(&peer_id) {
                debug!(peer_id = %peer_id, "already tracked");
                continue;
            }
            let role = self
                .role_policy
                .role_for(&self.local.user_uuid, &peer_id, RosterOrigin::Snapshot);
            self.track_peer(&peer, role);
            self.start_negotiation(&peer_id).await;
        }
    }

    pub async fn on_peer_joined(&mut self, peer: PeerInfo) {
        if peer.user_uuid == self.local.user_uuid {
            return;
        }
        let peer_id = peer.user_uuid.clone();
        self.room.add_member(peer.clone());
        info!(
            peer_id = %peer_id,
            username = %peer.username,
            members = self.room.member_count(),
            "peer joined"
        );
        if self.peers.contains_key(&peer_id) {
            debug!(peer_id = %peer_id, "already tracked");
            return;
        }
        let role = self
            .role_policy
            .role_for(&self.local.user_uuid, &peer_id, RosterOrigin::Joined);
        self.track_peer(&peer, role);
        self.start_negotiation(&peer_id).await;
    }

    pub async fn on_peer_left(&mut self, peer_id: &str) {
        self.room.remove_member(peer_id);
        info!(peer_id, members = self.room.member_count(), "peer left");
        self.close_peer(peer_id).await;
    }

    pub async fn on_signal_message(&mut self, sender: &str, payload: SignalPayload) {
        if sender == self.local.user_uuid {
            return;
        }
        debug!(peer_id = sender, kind = payload.kind(), "signal received");
        if let Some(session) = self.peers.get_mut(sender) {
            session.touch();
        }
        match payload {
            SignalPayload::Offer { sdp } => self.on_remote_offer(sender, sdp).await,
            SignalPayload::Answer { sdp } => self.on_remote_answer(sender, sdp).await,
            SignalPayload::Candidate { candidate } => {
                self.on_remote_candidate(sender, candidate).await
            }
        }
    }

    async fn on_remote_offer(&mut self, sender: &str, offer: SessionDescription) {
        let needs_fresh = match self.peers.get(sender) {
            None => {
                let info = match self.room.member(sender) {
                    Some(info) => info.clone(),
                    None => {
                        let info = PeerInfo {
                            user_uuid: sender.to_string(),
                            username: String::new(),
                        };
                        self.room.add_member(info.clone());
                        info
                    }
                };
                self.track_peer(&info, NegotiationRole::Responder);
                true
            }
            Some(session) if session.local_offer_pending => {
                if self.local.user_uuid.as_str() < sender {
                    debug!(peer_id = sender, "offer glare, keeping our own offer");
                    return;
                }
                debug!(peer_id = sender, "offer glare, answering the remote offer");
                true
            }
            Some(session) => session.negotiator.is_none() || session.remote_description_applied,
        };

        if let Some(session) = self.peers.get_mut(sender) {
            session.peer.role = NegotiationRole::Responder;
        }
        // The remote side restarted negotiation; our own timer would only
        // tear that down again.
        self.retries.cancel(sender);
        self.set_state(sender, PeerState::Negotiating(NegotiationRole::Responder));

        let negotiator = if needs_fresh {
            match self.open_negotiator(sender).await {
                Ok(negotiator) => negotiator,
                Err(e) => {
                    warn!(peer_id = sender, "cannot open negotiator: {}", e);
                    self.handle_failure(sender).await;
                    return;
                }
            }
        } else {
            match self.peers.get(sender).and_then(|s| s.negotiator.clone()) {
                Some(negotiator) => negotiator,
                None => return,
            }
        };

        match negotiator.accept_offer(offer).await {
            Ok(answer) => {
                if let Some(session) = self.peers.get_mut(sender) {
                    session.remote_description_applied = true;
                }
                self.send(ClientMessage::Signal {
                    target: sender.to_string(),
                    data: SignalPayload::Answer { sdp: answer },
                });
                self.flush_candidates(sender, &negotiator).await;
            }
            Err(e) => {
                warn!(peer_id = sender, "failed to answer offer: {}", e);
                self.handle_failure(sender).await;
            }
        }
    }

    async fn on_remote_answer(&mut self, sender: &str, answer: SessionDescription) {
        let Some(session) = self.peers.get(sender) else {
            warn!(peer_id = sender, "answer from untracked peer ignored");
            return;
        };
        let negotiator = match &session.negotiator {
            Some(negotiator) if session.local_offer_pending => negotiator.clone(),
            _ => {
                warn!(peer_id = sender, "unexpected answer ignored");
                return;
            }
        };

        match negotiator.accept_answer(answer).await {
            Ok(()) => {
                if let Some(session) = self.peers.get_mut(sender) {
                    session.local_offer_pending = false;
                    session.remote_description_applied = true;
                }
                self.flush_candidates(sender, &negotiator).await;
            }
            Err(e) => {
                warn!(peer_id = sender, "failed to apply answer: {}", e);
                self.handle_failure(sender).await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, sender: &str, candidate: IceCandidate) {
        let negotiator = match self.peers.get_mut(sender) {
            None => {
                if !self.early_candidates.contains_key(sender)
                    && self.early_candidates.len() >= MAX_EARLY_SENDERS
                {
                    debug!(peer_id = sender, "too many unknown candidate senders, dropping");
                    return;
                }
                let buffered = self.early_candidates.entry(sender.to_string()).or_default();
                if buffered.len() < MAX_EARLY_CANDIDATES {
                    buffered.push(candidate);
                } else {
                    debug!(peer_id = sender, "early candidate buffer full, dropping");
                }
                return;
            }
            Some(session) => match &session.negotiator {
                Some(negotiator) if session.remote_description_applied => negotiator.clone(),
                _ => {
                    session.pending_candidates.push(candidate);
                    return;
                }
            },
        };
        if let Err(e) = negotiator.add_candidate(candidate).await {
            warn!(peer_id = sender, "failed to add remote candidate: {}", e);
        }
    }

    async fn flush_candidates(&mut self, peer_id: &str, negotiator: &Arc<dyn Negotiator>) {
        let pending = match self.peers.get_mut(peer_id) {
            Some(session) => std::mem::take(&mut session.pending_candidates),
            None => return,
        };
        if !pending.is_empty() {
            debug!(peer_id, count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            if let Err(e) = negotiator.add_candidate(candidate).await {
                warn!(peer_id, "failed to add buffered candidate: {}", e);
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            peer_id,
            generation,
            kind,
        } = event;
        let Some(session) = self.peers.get_mut(&peer_id) else {
            debug!(peer_id = %peer_id, "transport event for untracked peer");
            return;
        };
        if session.generation != generation {
            debug!(peer_id = %peer_id, generation, current = session.generation, "stale transport event");
            return;
        }

        match kind {
            TransportEventKind::LocalCandidate(candidate) => self.send(ClientMessage::Signal {
                target: peer_id,
                data: SignalPayload::Candidate { candidate },
            }),
            TransportEventKind::Connected => {
                session.touch();
                session.disarm_deadline();
                self.retries.succeeded(&peer_id);
                self.set_state(&peer_id, PeerState::Connected);
            }
            TransportEventKind::Disconnected
            | TransportEventKind::Failed
            | TransportEventKind::Closed => self.handle_failure(&peer_id).await,
            TransportEventKind::RemoteTrack => info!(peer_id = %peer_id, "receiving remote audio"),
            TransportEventKind::AudioLevel(volume) => {
                let flipped = self
                    .playback
                    .get_mut(&peer_id)
                    .and_then(|control| control.observe_level(volume));
                if let Some(speaking) = flipped {
                    self.emit(SessionEvent::SpeakingChanged { peer_id, speaking });
                }
            }
        }
    }

    /// Moves the peer to Degraded and arms a retry, or closes it for good
    /// once the retry budget is spent.
    async fn handle_failure(&mut self, peer_id: &str) {
        let Some(state) = self.peers.get(peer_id).map(PeerSession::state) else {
            return;
        };
        if matches!(state, PeerState::Degraded | PeerState::Closed) {
            return;
        }
        if let Some(session) = self.peers.get_mut(peer_id) {
            session.disarm_deadline();
        }
        self.set_state(peer_id, PeerState::Degraded);

        match self.retries.schedule_retry(peer_id) {
            RetryDecision::Scheduled { attempt, delay } => {
                info!(
                    peer_id,
                    attempt,
                    max_retries = self.retries.policy().max_retries,
                    ?delay,
                    "connection degraded, retry scheduled"
                );
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(peer_id, attempts, "giving up on peer");
                self.close_peer(peer_id).await;
                self.emit(SessionEvent::PeerFailed {
                    peer_id: peer_id.to_string(),
                    attempts,
                });
            }
        }
    }

    async fn on_retry_due(&mut self, peer_id: &str) {
        if !self.retries.on_fired(peer_id) {
            debug!(peer_id, "retry was cancelled");
            return;
        }
        if !self.room.is_member(peer_id) || !self.peers.contains_key(peer_id) {
            info!(peer_id, "peer is gone, dropping retry");
            self.retries.cancel(peer_id);
            return;
        }
        if self.peer_state(peer_id) != Some(PeerState::Degraded) {
            debug!(peer_id, "peer recovered before retry");
            return;
        }
        info!(peer_id, attempt = self.retries.attempts(peer_id), "retrying negotiation");
        self.start_negotiation(peer_id).await;
    }

    /// A negotiator that has not connected in time counts as a failed
    /// attempt, whichever side was expected to move next.
    async fn on_negotiation_deadline(&mut self, peer_id: &str, generation: u64) {
        let Some(session) = self.peers.get_mut(peer_id) else {
            return;
        };
        if session.generation != generation {
            debug!(peer_id, generation, "stale negotiation deadline");
            return;
        }
        session.disarm_deadline();
        if !matches!(session.state(), PeerState::Negotiating(_)) {
            return;
        }
        warn!(
            peer_id,
            generation,
            timeout = ?self.negotiation_timeout,
            "peer did not connect in time"
        );
        self.handle_failure(peer_id).await;
    }

    async fn start_negotiation(&mut self, peer_id: &str) {
        let Some(role) = self.peers.get(peer_id).map(|s| s.peer.role) else {
            return;
        };
        self.set_state(peer_id, PeerState::Negotiating(role));

        let negotiator = match self.open_negotiator(peer_id).await {
            Ok(negotiator) => negotiator,
            Err(e) => {
                warn!(peer_id, "cannot open negotiator: {}", e);
                self.handle_failure(peer_id).await;
                return;
            }
        };
        if role != NegotiationRole::Initiator {
            return;
        }

        match negotiator.create_offer().await {
            Ok(offer) => {
                if let Some(session) = self.peers.get_mut(peer_id) {
                    session.local_offer_pending = true;
                }
                self.send(ClientMessage::Signal {
                    target: peer_id.to_string(),
                    data: SignalPayload::Offer { sdp: offer },
                });
            }
            Err(e) => {
                warn!(peer_id, "failed to create offer: {}", e);
                self.handle_failure(peer_id).await;
            }
        }
    }

    /// Replaces the peer's negotiator. The old one is closed before the new
    /// one is opened.
    async fn open_negotiator(&mut self, peer_id: &str) -> Result<Arc<dyn Negotiator>> {
        let previous = self
            .peers
            .get_mut(peer_id)
            .and_then(|session| session.negotiator.take());
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(peer_id, "closing previous negotiator: {}", e);
            }
            if let Some(session) = self.peers.get_mut(peer_id) {
                session.pending_candidates.clear();
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let playback = self.ensure_playback(peer_id).subscribe();
        let negotiator = self
            .factory
            .open(NegotiatorContext {
                peer_id: peer_id.to_string(),
                generation,
                events: self.inbox_tx.clone(),
                playback,
            })
            .await?;

        let Some(session) = self.peers.get_mut(peer_id) else {
            let _ = negotiator.close().await;
            return Err(AppError::negotiation(peer_id, "peer is no longer tracked"));
        };
        session.negotiator = Some(negotiator.clone());
        session.generation = generation;
        session.remote_description_applied = false;
        session.local_offer_pending = false;
        self.arm_deadline(peer_id, generation);
        debug!(peer_id, generation, "negotiator opened");
        Ok(negotiator)
    }

    fn arm_deadline(&mut self, peer_id: &str, generation: u64) {
        let timeout = self.negotiation_timeout;
        let inbox = self.inbox_tx.clone();
        let target = peer_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(SessionInput::NegotiationDeadline {
                peer_id: target,
                generation,
            });
        });
        match self.peers.get_mut(peer_id) {
            Some(session) => session.arm_deadline(timer),
            None => timer.abort(),
        }
    }

    fn track_peer(&mut self, info: &PeerInfo, role: NegotiationRole) {
        let mut session = PeerSession::new(info.user_uuid.clone(), info.username.clone(), role);
        if let Some(early) = self.early_candidates.remove(&info.user_uuid) {
            session.pending_candidates = early;
        }
        self.peers.insert(info.user_uuid.clone(), session);
        self.ensure_playback(&info.user_uuid);
    }

    fn ensure_playback(&mut self, peer_id: &str) -> &mut PlaybackControl {
        let gain = self.volumes.get(peer_id);
        let deafened = self.status.is_deafened;
        let threshold = self.speaking_threshold;
        self.playback
            .entry(peer_id.to_string())
            .or_insert_with(|| PlaybackControl::new(peer_id.to_string(), gain, deafened, threshold))
    }

    /// Closes the peer and forgets it. Safe to call for unknown peers.
    pub async fn close_peer(&mut self, peer_id: &str) {
        self.retries.cancel(peer_id);
        self.early_candidates.remove(peer_id);
        self.playback.remove(peer_id);
        let Some(mut session) = self.peers.remove(peer_id) else {
            return;
        };
        if let Some(negotiator) = session.negotiator.take() {
            if let Err(e) = negotiator.close().await {
                debug!(peer_id, "closing negotiator: {}", e);
            }
        }
        info!(peer_id, "peer closed");
        self.emit(SessionEvent::PeerStateChanged {
            peer_id: peer_id.to_string(),
            state: PeerState::Closed,
        });
        self.emit(SessionEvent::PeerClosed {
            peer_id: peer_id.to_string(),
        });
    }

    /// Cancels every retry and closes every peer.
    async fn teardown(&mut self) {
        self.retries.reset_all();
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.close_peer(&peer_id).await;
        }
        self.early_candidates.clear();
        self.room.clear();
    }

    pub async fn join_room(&mut self, room: &str) {
        if self.room.is_joined() {
            self.leave_room().await;
        }
        info!(room, "joining room");
        self.room.enter(room);
        self.send(ClientMessage::Join {
            room: room.to_string(),
        });
    }

    pub async fn leave_room(&mut self) {
        let was_joined = self.room.is_joined();
        if was_joined {
            info!(room = self.room.name().unwrap_or_default(), "leaving room");
            self.send(ClientMessage::Leave {});
        }
        self.teardown().await;
        if was_joined {
            self.emit(SessionEvent::Left);
        }
    }

    async fn on_command(&mut self, command: LocalCommand) {
        match command {
            LocalCommand::Join { room } => self.join_room(&room).await,
            LocalCommand::Leave => self.leave_room().await,
            LocalCommand::SetMicMuted(muted) => {
                self.status.is_mic_muted = muted;
                self.sync_mic();
                self.publish_status();
            }
            LocalCommand::SetDeafened(deafened) => {
                self.status.is_deafened = deafened;
                self.status.is_mic_muted = deafened;
                for control in self.playback.values_mut() {
                    control.set_deafened(deafened);
                }
                self.sync_mic();
                self.publish_status();
            }
            LocalCommand::SetStreaming(streaming) => {
                self.status.is_streaming = streaming;
                self.publish_status();
            }
            LocalCommand::SetPeerGain { peer_id, gain } => self.set_peer_gain(&peer_id, gain),
            LocalCommand::SetPeerMuted { peer_id, muted } => match self.playback.get_mut(&peer_id) {
                Some(control) => control.set_muted(muted),
                None => debug!(peer_id = %peer_id, "mute for unknown peer ignored"),
            },
            LocalCommand::SetNoiseSuppression(enabled) => {
                self.send_pipeline(PipelineCommand::SetSuppression(enabled))
            }
            LocalCommand::SetSuppressionMode(mode) => self.set_suppression_mode(mode),
            LocalCommand::RestartNoiseProfiling => self.send_pipeline(PipelineCommand::RestartProfiling),
            LocalCommand::SetSilenceGate { enabled, threshold } => {
                self.send_pipeline(PipelineCommand::SetSilenceGate { enabled, threshold })
            }
            LocalCommand::AddLoopbackSource { source_id, channels } => {
                self.with_loopback_mixer(|mixer| mixer.add_source(&source_id, channels))
            }
            LocalCommand::RemoveLoopbackSource { source_id } => {
                self.with_loopback_mixer(|mixer| mixer.remove_source(&source_id))
            }
            LocalCommand::PushLoopbackChunk { source_id, bytes } => {
                self.with_loopback_mixer(|mixer| mixer.push_chunk(&source_id, bytes))
            }
            LocalCommand::Shutdown => {}
        }
    }

    fn with_loopback_mixer(&self, f: impl FnOnce(&MixerHandle)) {
        match &self.loopback {
            Some(mixer) => f(mixer),
            None => debug!("no loopback mixer attached"),
        }
    }

    fn set_peer_gain(&mut self, peer_id: &str, gain: f32) {
        let gain = clamp_gain(gain);
        if let Err(e) = self.volumes.set(peer_id, gain) {
            warn!(peer_id, "cannot persist volume: {}", e);
        }
        if let Some(control) = self.playback.get_mut(peer_id) {
            control.set_gain(gain);
        }
        self.emit(SessionEvent::PeerGainChanged {
            peer_id: peer_id.to_string(),
            gain,
        });
    }

    fn set_suppression_mode(&self, mode: SuppressionMode) {
        self.send_pipeline(PipelineCommand::SetMode(mode));
    }

    fn sync_mic(&self) {
        let muted = self.status.is_mic_muted || self.status.is_deafened;
        self.send_pipeline(PipelineCommand::SetMicMuted(muted));
    }

    fn send_pipeline(&self, command: PipelineCommand) {
        match &self.pipeline {
            Some(pipeline) => pipeline.send(command),
            None => debug!("no publish pipeline attached"),
        }
    }

    /// Reports the local status to the application and, inside a room, to
    /// every other member.
    pub fn publish_status(&self) {
        let update = StatusUpdate {
            room: self.room.name().unwrap_or_default().to_string(),
            user_uuid: self.local.user_uuid.clone(),
            username: self.local.username.clone(),
            is_mic_muted: self.status.is_mic_muted,
            is_deafened: self.status.is_deafened,
            is_streaming: self.status.is_streaming,
        };
        self.emit(SessionEvent::LocalStatus(update.clone()));
        if self.room.is_joined() {
            self.send(ClientMessage::UserStatusUpdate(update));
        }
    }

    fn set_state(&mut self, peer_id: &str, state: PeerState) {
        let Some(session) = self.peers.get_mut(peer_id) else {
            return;
        };
        if session.peer.state == state {
            return;
        }
        debug!(peer_id, from = %session.peer.state, to = %state, "peer state changed");
        session.peer.state = state;
        self.emit(SessionEvent::PeerStateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            debug!("signaling channel closed, message dropped");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(PeerSession::state)
    }

    pub fn peer_role(&self, peer_id: &str) -> Option<NegotiationRole> {
        self.peers.get(peer_id).map(|s| s.peer.role)
    }

    pub fn peer_generation(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).map(|s| s.generation)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        self.peers
            .get(peer_id)
            .map(|s| s.pending_candidates.len())
            .or_else(|| self.early_candidates.get(peer_id).map(Vec::len))
            .unwrap_or(0)
    }

    /// Unknown senders with buffered candidates.
    pub fn early_candidate_senders(&self) -> usize {
        self.early_candidates.len()
    }

    pub fn has_negotiation_deadline(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).is_some_and(PeerSession::has_deadline)
    }

    pub fn pending_retry_timers(&self) -> usize {
        self.retries.pending_timers()
    }

    pub fn retry_attempts(&self, peer_id: &str) -> Option<u32> {
        self.retries.attempts(peer_id)
    }

    pub fn playback_gain(&self, peer_id: &str) -> Option<f32> {
        self.playback.get(peer_id).map(PlaybackControl::gain)
    }

    pub fn playback_muted(&self, peer_id: &str) -> Option<bool> {
        self.playback.get(peer_id).map(|c| c.settings().muted)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }
}
