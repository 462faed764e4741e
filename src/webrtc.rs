use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::codec::{decode_ulaw, StreamResampler, PCMU_SAMPLE_RATE};
use crate::audio::mixer::MixerHandle;
use crate::audio::pipeline::PacketSink;
use crate::audio::playback::PlaybackSettings;
use crate::audio::spectrum::{volume_percent, SpectrumAnalyzer};
use crate::connection::ConnectionMonitor;
use crate::error::{AppError, Result};
use crate::session::events::TransportEventKind;
use crate::session::negotiator::{Negotiator, NegotiatorContext, NegotiatorFactory};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

const LEVEL_FFT_SIZE: usize = 256;

fn pcmu_track(id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: PCMU_SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ))
}

/// The microphone track, shared by every peer connection.
pub fn local_audio_track() -> Arc<TrackLocalStaticSample> {
    pcmu_track("audio", "voice-room-client")
}

/// Mixed loopback audio, published next to the microphone.
pub fn loopback_audio_track() -> Arc<TrackLocalStaticSample> {
    pcmu_track("loopback", "voice-room-client-loopback")
}

/// Publishes encoded packets on the local track.
pub struct TrackSink {
    track: Arc<TrackLocalStaticSample>,
}

impl TrackSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl PacketSink for TrackSink {
    async fn write_packet(&self, payload: Bytes, duration: Duration) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: payload,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// Where decoded remote audio goes and how often its level is reported.
#[derive(Clone)]
pub struct PlaybackRoute {
    pub mixer: MixerHandle,
    pub sample_rate: u32,
    pub level_interval: Duration,
}

pub struct RtcNegotiatorFactory {
    api: API,
    config: RTCConfiguration,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
    playback: PlaybackRoute,
}

impl RtcNegotiatorFactory {
    /// Every peer connection sends each of `local_tracks`.
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        local_tracks: Vec<Arc<TrackLocalStaticSample>>,
        playback: PlaybackRoute,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            local_tracks,
            playback,
        })
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn open(&self, ctx: NegotiatorContext) -> Result<Arc<dyn Negotiator>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let monitor = ConnectionMonitor::new(ctx.peer_id.clone(), ctx.generation, ctx.events.clone());
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let sources: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for track in &self.local_tracks {
            let rtp_sender = peer_connection
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be read for the interceptors to run.
            track_task(
                &tasks,
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut buf).await.is_ok() {}
                }),
            );
        }

        let candidate_monitor = monitor.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let monitor = candidate_monitor.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => monitor.report(TransportEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("cannot serialize local candidate: {}", e),
                }
            })
        }));

        let state_monitor = monitor.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            state_monitor.update_peer_state(s);
            Box::pin(async {})
        }));

        let signaling_monitor = monitor.clone();
        peer_connection.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            signaling_monitor.update_signaling_state(s);
            Box::pin(async {})
        }));

        let ice_monitor = monitor.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            ice_monitor.update_ice_state(s);
            Box::pin(async {})
        }));

        let route = self.playback.clone();
        let track_monitor = monitor.clone();
        let track_tasks = tasks.clone();
        let settings = ctx.playback.clone();
        let peer_id = ctx.peer_id.clone();
        let track_sources = sources.clone();
        let level_claimed = Arc::new(AtomicBool::new(false));
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    // One mixer source per remote track; the first one drives
                    // the speaking indicator.
                    let source_id = format!("{}/{}", peer_id, track.id());
                    let reports_level = !level_claimed.swap(true, Ordering::SeqCst);
                    info!(peer_id = %peer_id, source_id = %source_id, ssrc = track.ssrc(), "remote audio track");
                    if let Ok(mut sources) = track_sources.lock() {
                        sources.push(source_id.clone());
                    }
                    track_monitor.report(TransportEventKind::RemoteTrack);
                    let handle = tokio::spawn(play_remote_track(
                        track,
                        source_id,
                        route.clone(),
                        settings.clone(),
                        reports_level.then(|| track_monitor.clone()),
                    ));
                    track_task(&track_tasks, handle);
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcNegotiator {
            peer_id: ctx.peer_id,
            peer_connection,
            mixer: self.playback.mixer.clone(),
            tasks,
            sources,
            closed: AtomicBool::new(false),
        }))
    }
}

fn track_task(tasks: &Mutex<Vec<JoinHandle<()>>>, handle: JoinHandle<()>) {
    match tasks.lock() {
        Ok(mut tasks) => tasks.push(handle),
        Err(_) => handle.abort(),
    }
}

/// Decodes a remote PCMU track into the playback mixer under `source_id`.
/// With a `monitor`, the track's volume is reported every `level_interval`.
async fn play_remote_track(
    track: Arc<TrackRemote>,
    source_id: String,
    route: PlaybackRoute,
    settings: watch::Receiver<PlaybackSettings>,
    monitor: Option<ConnectionMonitor>,
) {
    let mut resampler = match StreamResampler::new(PCMU_SAMPLE_RATE, route.sample_rate) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!(source_id = %source_id, "cannot play remote track: {}", e);
            return;
        }
    };
    let mut analyzer = SpectrumAnalyzer::new(LEVEL_FFT_SIZE);
    let mut levels = tokio::time::interval(route.level_interval);
    route.mixer.add_source(&source_id, 1);

    loop {
        tokio::select! {
            packet = track.read_rtp() => {
                let (packet, _) = match packet {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(source_id = %source_id, "remote track ended: {}", e);
                        break;
                    }
                };
                if packet.payload.is_empty() {
                    continue;
                }
                let decoded = decode_ulaw(&packet.payload);
                analyzer.push_samples(&decoded);
                let mut samples = resampler.process(&decoded);
                if samples.is_empty() {
                    continue;
                }
                settings.borrow().apply(&mut samples);
                route.mixer.push_samples(&source_id, samples);
            }
            _ = levels.tick() => {
                if let Some(monitor) = &monitor {
                    let volume = volume_percent(&analyzer.byte_frequency_data());
                    monitor.report(TransportEventKind::AudioLevel(volume));
                }
            }
        }
    }
}

pub struct RtcNegotiator {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    mixer: MixerHandle,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Mixer sources fed by this connection's remote tracks.
    sources: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
}

impl RtcNegotiator {
    fn to_rtc(&self, description: SessionDescription) -> Result<RTCSessionDescription> {
        let rtc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            SdpKind::Rollback => {
                return Err(AppError::negotiation(&self.peer_id, "rollback is not supported"))
            }
        };
        Ok(rtc)
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(AppError::negotiation(&self.peer_id, "expected an offer"));
        }
        self.peer_connection
            .set_remote_description(self.to_rtc(offer)?)
            .await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(self.to_rtc(answer)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut sources) = self.sources.lock() {
            for source_id in sources.drain(..) {
                self.mixer.remove_source(&source_id);
            }
        }
        self.peer_connection.close().await?;
        debug!(peer_id = %self.peer_id, "peer connection closed");
        Ok(())
    }
}
