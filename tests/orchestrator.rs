use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use voice_room_client::audio::codec::encode_ulaw;
use voice_room_client::audio::loopback::spawn_loopback_publisher;
use voice_room_client::audio::mixer::spawn_mixer;
use voice_room_client::audio::pipeline::PacketSink;
use voice_room_client::config::{ClientConfig, MixerConfig};
use voice_room_client::error::Result;
use voice_room_client::session::events::{
    LocalCommand, SessionEvent, SessionInput, TransportEvent, TransportEventKind,
};
use voice_room_client::session::negotiator::{Negotiator, NegotiatorContext, NegotiatorFactory};
use voice_room_client::session::orchestrator::{MAX_EARLY_CANDIDATES, MAX_EARLY_SENDERS};
use voice_room_client::session::peer::{NegotiationRole, PeerState};
use voice_room_client::signaling::{
    ClientMessage, IceCandidate, PeerInfo, ServerMessage, SdpKind, SessionDescription,
    SignalPayload,
};
use voice_room_client::Orchestrator;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    candidates: Mutex<Vec<IceCandidate>>,
}

struct FakeNegotiator {
    generation: u64,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-{}", self.generation)))
    }

    async fn accept_offer(&self, _offer: SessionDescription) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-{}", self.generation)))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.counters.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeFactory {
    counters: Arc<Counters>,
}

#[async_trait]
impl NegotiatorFactory for FakeFactory {
    async fn open(&self, ctx: NegotiatorContext) -> Result<Arc<dyn Negotiator>> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(FakeNegotiator {
            generation: ctx.generation,
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    counters: Arc<Counters>,
}

impl Harness {
    fn new(local_id: &str) -> Self {
        let factory = FakeFactory::default();
        let counters = factory.counters.clone();
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (ev_tx, events) = mpsc::unbounded_channel();
        let local = PeerInfo {
            user_uuid: local_id.to_string(),
            username: "local".to_string(),
        };
        let orchestrator =
            Orchestrator::new(&ClientConfig::default(), local, Arc::new(factory), out_tx, ev_tx);
        Self {
            orchestrator,
            outbound,
            events,
            counters,
        }
    }

    async fn signal(&mut self, message: ServerMessage) {
        assert!(self.orchestrator.dispatch(SessionInput::Signal(message)).await);
    }

    async fn command(&mut self, command: LocalCommand) {
        assert!(self.orchestrator.dispatch(SessionInput::Command(command)).await);
    }

    async fn transport(&mut self, peer_id: &str, kind: TransportEventKind) {
        let generation = self.orchestrator.peer_generation(peer_id).unwrap();
        self.transport_at(peer_id, generation, kind).await;
    }

    async fn transport_at(&mut self, peer_id: &str, generation: u64, kind: TransportEventKind) {
        let event = TransportEvent {
            peer_id: peer_id.to_string(),
            generation,
            kind,
        };
        assert!(self.orchestrator.dispatch(SessionInput::Transport(event)).await);
    }

    async fn join(&mut self, room: &str) {
        self.command(LocalCommand::Join { room: room.into() }).await;
        self.signal(ServerMessage::Joined { room: room.into() }).await;
    }

    async fn offer_from(&mut self, sender: &str) {
        self.signal(ServerMessage::Signal {
            sender: sender.into(),
            data: SignalPayload::Offer {
                sdp: SessionDescription::offer("v=0 remote"),
            },
        })
        .await;
    }

    fn sent(&mut self) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            sent.push(message);
        }
        sent
    }

    fn emitted(&mut self) -> Vec<SessionEvent> {
        let mut emitted = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            emitted.push(event);
        }
        emitted
    }
}

fn peer(id: &str) -> PeerInfo {
    PeerInfo {
        user_uuid: id.into(),
        username: id.to_uppercase(),
    }
}

fn candidate_from(sender: &str, n: usize) -> ServerMessage {
    ServerMessage::Signal {
        sender: sender.into(),
        data: SignalPayload::Candidate {
            candidate: IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.2 {} typ host", n, 50000 + n),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        },
    }
}

/// Dispatches whatever the timers deliver until `peer_id` is gone, and
/// returns how many retries and negotiation deadlines fired.
async fn run_until_closed(h: &mut Harness, peer_id: &str) -> (usize, usize) {
    let (mut retries, mut deadlines) = (0, 0);
    while h.orchestrator.peer_state(peer_id).is_some() {
        let input = tokio::time::timeout(Duration::from_secs(120), h.orchestrator.next_input())
            .await
            .expect("a timer should move the peer along")
            .unwrap();
        match &input {
            SessionInput::RetryDue(_) => retries += 1,
            SessionInput::NegotiationDeadline { .. } => deadlines += 1,
            other => panic!("unexpected input {:?}", other),
        }
        h.orchestrator.dispatch(input).await;
    }
    (retries, deadlines)
}

fn signals_to(sent: &[ClientMessage], target: &str, kind: SdpKind) -> usize {
    sent.iter()
        .filter(|m| match m {
            ClientMessage::Signal {
                target: t,
                data: SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp },
            } => t == target && sdp.kind == kind,
            _ => false,
        })
        .count()
}

#[tokio::test]
async fn newcomer_offers_and_connects() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    assert!(h.sent().contains(&ClientMessage::Join { room: "lobby".into() }));

    h.signal(ServerMessage::Peers {
        peers: vec![peer("a"), peer("b")],
    })
    .await;
    assert_eq!(h.orchestrator.peer_count(), 1);
    assert_eq!(
        h.orchestrator.peer_state("b"),
        Some(PeerState::Negotiating(NegotiationRole::Initiator))
    );
    assert_eq!(signals_to(&h.sent(), "b", SdpKind::Offer), 1);

    h.signal(ServerMessage::Signal {
        sender: "b".into(),
        data: SignalPayload::Answer {
            sdp: SessionDescription::answer("v=0 answer"),
        },
    })
    .await;
    h.transport("b", TransportEventKind::Connected).await;
    assert_eq!(h.orchestrator.peer_state("b"), Some(PeerState::Connected));
    assert!(h.emitted().contains(&SessionEvent::PeerStateChanged {
        peer_id: "b".into(),
        state: PeerState::Connected,
    }));
}

#[tokio::test]
async fn joined_peer_is_answered() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::PeerJoined(peer("c"))).await;
    assert_eq!(h.orchestrator.peer_role("c"), Some(NegotiationRole::Responder));
    assert_eq!(signals_to(&h.sent(), "c", SdpKind::Offer), 0);

    h.offer_from("c").await;
    assert_eq!(signals_to(&h.sent(), "c", SdpKind::Answer), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.transport("b", TransportEventKind::Failed).await;
    assert_eq!(h.orchestrator.peer_state("b"), Some(PeerState::Degraded));

    let mut fired = 0;
    loop {
        let input = tokio::time::timeout(Duration::from_secs(60), h.orchestrator.next_input())
            .await
            .expect("retry timer should fire")
            .unwrap();
        assert_eq!(input, SessionInput::RetryDue("b".into()));
        fired += 1;
        h.orchestrator.dispatch(input).await;
        assert_eq!(
            h.orchestrator.peer_state("b"),
            Some(PeerState::Negotiating(NegotiationRole::Initiator))
        );
        h.transport("b", TransportEventKind::Failed).await;
        if h.orchestrator.peer_state("b").is_none() {
            break;
        }
    }

    assert_eq!(fired, 3);
    assert_eq!(h.orchestrator.pending_retry_timers(), 0);
    assert!(h.emitted().contains(&SessionEvent::PeerFailed {
        peer_id: "b".into(),
        attempts: 3,
    }));
    assert!(
        tokio::time::timeout(Duration::from_secs(60), h.orchestrator.next_input())
            .await
            .is_err()
    );
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resets_the_retry_budget() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.transport("b", TransportEventKind::Disconnected).await;
    assert_eq!(h.orchestrator.retry_attempts("b"), Some(1));

    let input = h.orchestrator.next_input().await.unwrap();
    h.orchestrator.dispatch(input).await;
    h.transport("b", TransportEventKind::Connected).await;
    assert_eq!(h.orchestrator.retry_attempts("b"), None);
    assert_eq!(h.orchestrator.peer_state("b"), Some(PeerState::Connected));
}

#[tokio::test(start_paused = true)]
async fn leaving_cancels_pending_retries() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers {
        peers: vec![peer("b"), peer("c")],
    })
    .await;
    h.transport("b", TransportEventKind::Failed).await;
    h.transport("c", TransportEventKind::Failed).await;
    assert_eq!(h.orchestrator.pending_retry_timers(), 2);
    h.sent();

    h.command(LocalCommand::Leave).await;
    assert_eq!(h.orchestrator.pending_retry_timers(), 0);
    assert_eq!(h.orchestrator.peer_count(), 0);
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
    assert!(h.sent().contains(&ClientMessage::Leave {}));
    assert!(h.emitted().contains(&SessionEvent::Left));
    assert!(
        tokio::time::timeout(Duration::from_secs(30), h.orchestrator.next_input())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn departed_peer_is_closed() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.signal(ServerMessage::PeerLeft(peer("b"))).await;
    assert_eq!(h.orchestrator.peer_state("b"), None);
    assert!(!h.orchestrator.room().is_member("b"));
    assert!(h.emitted().contains(&SessionEvent::PeerClosed { peer_id: "b".into() }));

    // A second departure for the same peer is a no-op.
    h.signal(ServerMessage::PeerLeft(peer("b"))).await;
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn candidates_before_offer_are_buffered() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Signal {
        sender: "c".into(),
        data: SignalPayload::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        },
    })
    .await;
    assert_eq!(h.orchestrator.pending_candidates("c"), 1);
    assert!(h.counters.candidates.lock().unwrap().is_empty());

    h.offer_from("c").await;
    assert_eq!(h.orchestrator.pending_candidates("c"), 0);
    assert_eq!(h.counters.candidates.lock().unwrap().len(), 1);
    assert_eq!(signals_to(&h.sent(), "c", SdpKind::Answer), 1);
}

#[tokio::test]
async fn offer_before_roster_creates_peer() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.offer_from("d").await;
    assert_eq!(h.orchestrator.peer_role("d"), Some(NegotiationRole::Responder));
    assert!(h.orchestrator.room().is_member("d"));
    assert_eq!(signals_to(&h.sent(), "d", SdpKind::Answer), 1);

    // The late roster entry does not start a second negotiation.
    h.signal(ServerMessage::PeerJoined(peer("d"))).await;
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn offer_glare_is_broken_by_peer_id() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.sent();
    h.offer_from("b").await;
    assert_eq!(signals_to(&h.sent(), "b", SdpKind::Answer), 0);
    assert_eq!(h.orchestrator.peer_role("b"), Some(NegotiationRole::Initiator));

    let mut h = Harness::new("z");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.sent();
    h.offer_from("b").await;
    assert_eq!(signals_to(&h.sent(), "b", SdpKind::Answer), 1);
    assert_eq!(h.orchestrator.peer_role("b"), Some(NegotiationRole::Responder));
}

#[tokio::test]
async fn at_most_one_negotiator_per_peer() {
    let mut h = Harness::new("z");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.offer_from("b").await;
    h.offer_from("b").await;
    h.offer_from("b").await;

    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 4);
    assert_eq!(h.counters.max_live.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 1);

    h.command(LocalCommand::Leave).await;
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_generation_events_are_ignored() {
    let mut h = Harness::new("z");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    let first = h.orchestrator.peer_generation("b").unwrap();
    h.offer_from("b").await;
    let second = h.orchestrator.peer_generation("b").unwrap();
    assert!(second > first);

    h.transport_at("b", first, TransportEventKind::Failed).await;
    assert_eq!(
        h.orchestrator.peer_state("b"),
        Some(PeerState::Negotiating(NegotiationRole::Responder))
    );
    assert_eq!(h.orchestrator.pending_retry_timers(), 0);

    h.transport_at("b", second, TransportEventKind::Connected).await;
    assert_eq!(h.orchestrator.peer_state("b"), Some(PeerState::Connected));
}

#[tokio::test]
async fn local_candidates_are_relayed() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.sent();
    let candidate = IceCandidate {
        candidate: "candidate:2 1 udp 1686052607 203.0.113.7 40000 typ srflx".into(),
        ..Default::default()
    };
    h.transport("b", TransportEventKind::LocalCandidate(candidate.clone()))
        .await;
    assert_eq!(
        h.sent(),
        vec![ClientMessage::Signal {
            target: "b".into(),
            data: SignalPayload::Candidate { candidate },
        }]
    );
}

#[tokio::test]
async fn peer_gain_is_clamped_and_remembered() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.command(LocalCommand::SetPeerGain {
        peer_id: "b".into(),
        gain: 7.0,
    })
    .await;
    assert_eq!(h.orchestrator.playback_gain("b"), Some(2.5));
    assert!(h.emitted().contains(&SessionEvent::PeerGainChanged {
        peer_id: "b".into(),
        gain: 2.5,
    }));

    h.signal(ServerMessage::PeerLeft(peer("b"))).await;
    h.signal(ServerMessage::PeerJoined(peer("b"))).await;
    assert_eq!(h.orchestrator.playback_gain("b"), Some(2.5));

    h.command(LocalCommand::SetPeerGain {
        peer_id: "b".into(),
        gain: -1.0,
    })
    .await;
    assert_eq!(h.orchestrator.playback_gain("b"), Some(0.0));
}

#[tokio::test]
async fn deafen_mutes_everything() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.sent();

    h.command(LocalCommand::SetDeafened(true)).await;
    let status = h.orchestrator.status();
    assert!(status.is_deafened && status.is_mic_muted);
    assert_eq!(h.orchestrator.playback_muted("b"), Some(true));
    let sent = h.sent();
    assert!(sent.iter().any(|m| matches!(
        m,
        ClientMessage::UserStatusUpdate(update) if update.is_deafened && update.is_mic_muted
    )));

    h.command(LocalCommand::SetDeafened(false)).await;
    let status = h.orchestrator.status();
    assert!(!status.is_deafened && !status.is_mic_muted);
    assert_eq!(h.orchestrator.playback_muted("b"), Some(false));
}

#[tokio::test]
async fn audio_level_drives_speaking_indicator() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.emitted();

    h.transport("b", TransportEventKind::AudioLevel(40)).await;
    h.transport("b", TransportEventKind::AudioLevel(35)).await;
    h.transport("b", TransportEventKind::AudioLevel(2)).await;
    let speaking: Vec<_> = h
        .emitted()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::SpeakingChanged { speaking, .. } => Some(speaking),
            _ => None,
        })
        .collect();
    assert_eq!(speaking, vec![true, false]);
}

#[tokio::test]
async fn lost_signaling_closes_every_peer() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers {
        peers: vec![peer("b"), peer("c")],
    })
    .await;
    assert!(h.orchestrator.dispatch(SessionInput::SignalingLost).await);
    assert_eq!(h.orchestrator.peer_count(), 0);
    assert!(!h.orchestrator.room().is_joined());
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ping_is_answered_and_shutdown_stops() {
    let mut h = Harness::new("a");
    h.signal(ServerMessage::Ping).await;
    assert_eq!(h.sent(), vec![ClientMessage::Pong]);
    assert!(
        !h.orchestrator
            .dispatch(SessionInput::Command(LocalCommand::Shutdown))
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_times_out_until_the_peer_fails() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    assert!(h.orchestrator.has_negotiation_deadline("b"));
    assert_eq!(h.orchestrator.pending_retry_timers(), 0);

    let (retries, deadlines) = run_until_closed(&mut h, "b").await;
    assert_eq!((retries, deadlines), (3, 4));
    assert_eq!(signals_to(&h.sent(), "b", SdpKind::Offer), 4);
    assert!(h.emitted().contains(&SessionEvent::PeerFailed {
        peer_id: "b".into(),
        attempts: 3,
    }));
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
    assert!(
        tokio::time::timeout(Duration::from_secs(60), h.orchestrator.next_input())
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn responder_left_waiting_for_an_offer_fails() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::PeerJoined(peer("c"))).await;
    h.offer_from("c").await;
    h.transport("c", TransportEventKind::Connected).await;
    assert!(!h.orchestrator.has_negotiation_deadline("c"));

    // The remote side never offers again after the link drops.
    h.transport("c", TransportEventKind::Failed).await;
    let (retries, deadlines) = run_until_closed(&mut h, "c").await;
    assert_eq!((retries, deadlines), (3, 3));
    assert_eq!(signals_to(&h.sent(), "c", SdpKind::Offer), 0);
    assert!(h.emitted().contains(&SessionEvent::PeerFailed {
        peer_id: "c".into(),
        attempts: 3,
    }));
    assert_eq!(h.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn early_candidates_are_bounded_per_sender() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    for n in 0..MAX_EARLY_CANDIDATES + 6 {
        h.signal(candidate_from("c", n)).await;
    }
    assert_eq!(h.orchestrator.pending_candidates("c"), MAX_EARLY_CANDIDATES);

    h.offer_from("c").await;
    assert_eq!(
        h.counters.candidates.lock().unwrap().len(),
        MAX_EARLY_CANDIDATES
    );
}

#[tokio::test]
async fn early_candidates_are_dropped_for_absent_senders() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    for n in 0..MAX_EARLY_SENDERS + 8 {
        h.signal(candidate_from(&format!("s{:02}", n), n)).await;
    }
    assert_eq!(h.orchestrator.early_candidate_senders(), MAX_EARLY_SENDERS);
    assert_eq!(
        h.orchestrator
            .pending_candidates(&format!("s{:02}", MAX_EARLY_SENDERS)),
        0
    );

    h.signal(ServerMessage::Peers {
        peers: vec![peer("s00")],
    })
    .await;
    assert_eq!(h.orchestrator.early_candidate_senders(), 0);
    assert_eq!(h.orchestrator.pending_candidates("s00"), 1);
    assert_eq!(h.orchestrator.pending_candidates("s01"), 0);
}

#[tokio::test]
async fn answer_without_a_session_is_ignored() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.sent();
    h.emitted();

    h.signal(ServerMessage::Signal {
        sender: "x".into(),
        data: SignalPayload::Answer {
            sdp: SessionDescription::answer("v=0 stray"),
        },
    })
    .await;
    assert_eq!(h.orchestrator.peer_count(), 0);
    assert!(!h.orchestrator.room().is_member("x"));
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 0);
    assert!(h.sent().is_empty());
    assert!(h.emitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_for_a_departed_peer_does_nothing() {
    let mut h = Harness::new("a");
    h.join("lobby").await;
    h.signal(ServerMessage::Peers { peers: vec![peer("b")] }).await;
    h.transport("b", TransportEventKind::Failed).await;
    h.sent();

    // The timer fires while the departure is still on its way.
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.signal(ServerMessage::PeerLeft(peer("b"))).await;
    let input = h.orchestrator.next_input().await.unwrap();
    assert_eq!(input, SessionInput::RetryDue("b".into()));
    assert!(h.orchestrator.dispatch(input).await);

    assert_eq!(h.orchestrator.peer_count(), 0);
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(signals_to(&h.sent(), "b", SdpKind::Offer), 0);
    assert_eq!(h.orchestrator.pending_retry_timers(), 0);
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<Bytes>>);

#[async_trait]
impl PacketSink for CollectingSink {
    async fn write_packet(&self, payload: Bytes, _duration: Duration) -> Result<()> {
        self.0.lock().unwrap().push(payload);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn loopback_audio_is_published() {
    let config = MixerConfig {
        sample_rate: 8000,
        channels: 1,
        max_queue_size: 50,
        frame_size: 160,
    };
    let (frame_tx, frame_rx) = mpsc::channel(8);
    let mixer = spawn_mixer(&config, frame_tx);
    let sink = Arc::new(CollectingSink::default());
    spawn_loopback_publisher(config.sample_rate, config.channels, frame_rx, sink.clone()).unwrap();

    let mut h = Harness::new("a");
    h.orchestrator = h.orchestrator.with_loopback(mixer);
    h.command(LocalCommand::AddLoopbackSource {
        source_id: "player".into(),
        channels: 1,
    })
    .await;
    let chunk: Vec<u8> = std::iter::repeat([0x00, 0x40]).take(160).flatten().collect();
    h.command(LocalCommand::PushLoopbackChunk {
        source_id: "player".into(),
        bytes: chunk,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let packets = sink.0.lock().unwrap().clone();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].as_ref(), encode_ulaw(&[0.5; 160]).as_slice());

    h.command(LocalCommand::RemoveLoopbackSource {
        source_id: "player".into(),
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.0.lock().unwrap().len(), 1);
}
