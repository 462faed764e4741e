use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::random;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use voice_room_client::audio::device::{AudioCapture, AudioOutput};
use voice_room_client::audio::loopback::spawn_loopback_publisher;
use voice_room_client::audio::mixer::spawn_mixer;
use voice_room_client::audio::pipeline::{spawn_pipeline, PipelineSettings};
use voice_room_client::config::{ClientConfig, MixerConfig};
use voice_room_client::ice::resolve_ice_servers;
use voice_room_client::logging;
use voice_room_client::relay::{run_relay, RelaySettings, WsRelayConnector};
use voice_room_client::session::events::{LocalCommand, SessionEvent, SessionInput};
use voice_room_client::signaling::PeerInfo;
use voice_room_client::webrtc::{
    local_audio_track, loopback_audio_track, PlaybackRoute, RtcNegotiatorFactory, TrackSink,
};
use voice_room_client::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "voice-room-client", about = "Join a peer-to-peer voice room")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling relay URL, overrides the config file.
    #[arg(long)]
    url: Option<String>,

    #[arg(short, long)]
    room: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    /// Raw little-endian PCM16 stream from another process (a file or FIFO),
    /// mixed into the loopback track. Repeatable.
    #[arg(long = "loopback", value_name = "PATH")]
    loopback: Vec<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn random_user_uuid() -> String {
    let bits: u128 = random();
    let hex = format!("{:032x}", bits);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(url) = &cli.url {
        config.signaling.url = url.clone();
    }
    if let Some(room) = &cli.room {
        config.signaling.room = room.clone();
    }
    if let Some(username) = &cli.username {
        config.identity.username = username.clone();
    }
    if config.identity.user_uuid.is_empty() {
        config.identity.user_uuid = random_user_uuid();
    }
    if config.identity.username.is_empty() {
        let tag: String = config.identity.user_uuid.chars().take(4).collect();
        config.identity.username = format!("guest-{}", tag);
    }
    config.validate()?;
    Ok(config)
}

/// Streams one loopback source into the orchestrator, a mixer frame at a time.
async fn feed_loopback(
    path: PathBuf,
    channels: usize,
    frame_size: usize,
    inbox: mpsc::UnboundedSender<SessionInput>,
) {
    let source_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "cannot open loopback source: {}", e);
            return;
        }
    };

    let send = |command| inbox.send(SessionInput::Command(command)).is_ok();
    if !send(LocalCommand::AddLoopbackSource {
        source_id: source_id.clone(),
        channels,
    }) {
        return;
    }
    info!(source_id = %source_id, channels, "loopback source attached");

    let mut chunk = vec![0u8; frame_size * channels * 2];
    loop {
        match file.read_exact(&mut chunk).await {
            Ok(_) => {
                let pushed = send(LocalCommand::PushLoopbackChunk {
                    source_id: source_id.clone(),
                    bytes: chunk.clone(),
                });
                if !pushed {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!(source_id = %source_id, "loopback read failed: {}", e);
                break;
            }
        }
    }
    info!(source_id = %source_id, "loopback source ended");
    send(LocalCommand::RemoveLoopbackSource { source_id });
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined { room } => info!(room = %room, "in room"),
        SessionEvent::Left => info!("left room"),
        SessionEvent::PeerStateChanged { peer_id, state } => {
            info!(peer_id = %peer_id, %state, "peer state")
        }
        SessionEvent::PeerFailed { peer_id, attempts } => {
            warn!(peer_id = %peer_id, attempts, "peer unreachable")
        }
        SessionEvent::SpeakingChanged { peer_id, speaking } => {
            debug!(peer_id = %peer_id, speaking, "speaking")
        }
        SessionEvent::SilenceChanged { silent, volume } => debug!(silent, volume, "microphone gate"),
        SessionEvent::ServerError { message } => warn!(message = %message, "relay error"),
        other => debug!(event = ?other, "session event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.logging, cli.verbose)?;

    info!(
        user_uuid = %config.identity.user_uuid,
        username = %config.identity.username,
        room = %config.signaling.room,
        "starting voice room client"
    );

    // Audio devices are required before joining.
    let (frame_tx, frame_rx) = mpsc::channel(8);
    let output = AudioOutput::open(frame_rx).context("opening speaker")?;
    let mixer_config = MixerConfig {
        sample_rate: output.sample_rate,
        channels: output.channels,
        ..config.mixer.clone()
    };
    let mixer = spawn_mixer(&mixer_config, frame_tx);

    let (capture_tx, capture_rx) = mpsc::channel(32);
    let capture = AudioCapture::open(capture_tx).context("opening microphone")?;

    let ice_servers = resolve_ice_servers(&config.ice).await;
    let local_track = local_audio_track();
    let loopback_track = loopback_audio_track();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pipeline = spawn_pipeline(
        PipelineSettings {
            noise: config.noise.clone(),
            silence: config.silence.clone(),
            sample_rate: capture.sample_rate,
        },
        capture_rx,
        Arc::new(TrackSink::new(Arc::clone(&local_track))),
        events_tx.clone(),
    )?;

    let (loopback_tx, loopback_rx) = mpsc::channel(8);
    let loopback = spawn_mixer(&config.loopback, loopback_tx);
    spawn_loopback_publisher(
        config.loopback.sample_rate,
        config.loopback.channels,
        loopback_rx,
        Arc::new(TrackSink::new(Arc::clone(&loopback_track))),
    )?;

    let factory = RtcNegotiatorFactory::new(
        ice_servers,
        vec![local_track, loopback_track],
        PlaybackRoute {
            mixer,
            sample_rate: output.sample_rate,
            level_interval: Duration::from_millis(config.playback.analyzer_interval_ms),
        },
    )?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let local = PeerInfo {
        user_uuid: config.identity.user_uuid.clone(),
        username: config.identity.username.clone(),
    };
    let orchestrator = Orchestrator::new(&config, local, Arc::new(factory), outbound_tx, events_tx)
        .with_pipeline(pipeline)
        .with_loopback(loopback);
    let inbox = orchestrator.handle();

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    for path in cli.loopback.clone() {
        tokio::spawn(feed_loopback(
            path,
            config.loopback.channels,
            config.loopback.frame_size,
            inbox.clone(),
        ));
    }

    let session = tokio::spawn(orchestrator.run());
    // The relay task joins the room on every connection it makes.
    let mut relay = tokio::spawn(run_relay(
        WsRelayConnector::new(&config.signaling),
        RelaySettings::from(&config.signaling),
        outbound_rx,
        inbox.clone(),
    ));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutting down");
            let _ = inbox.send(SessionInput::Command(LocalCommand::Leave));
            Ok(())
        }
        finished = &mut relay => match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!(
                "signaling relay {} lost",
                config.signaling.url
            ))),
            Err(e) => Err(anyhow::Error::new(e).context("relay task failed")),
        },
    };

    let _ = inbox.send(SessionInput::Command(LocalCommand::Shutdown));
    if let Err(e) = session.await {
        error!("session task failed: {}", e);
    }
    // The relay drains the leave message once the session has stopped.
    if !relay.is_finished()
        && tokio::time::timeout(Duration::from_secs(1), &mut relay)
            .await
            .is_err()
    {
        debug!("relay did not finish in time");
        relay.abort();
    }
    // Give the socket writer a moment to flush the leave message.
    tokio::time::sleep(Duration::from_millis(200)).await;

    drop(capture);
    drop(output);
    outcome
}
