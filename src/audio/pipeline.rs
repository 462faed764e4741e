//! Publish path: microphone samples in, gated and suppressed PCMU packets out.
//!
//! [`PublishProcessor`] holds the synchronous state (two analyzers, the noise
//! suppressor, the silence gate and the mute flag). [`spawn_pipeline`] drives
//! it from capture chunks and three `tokio::time::interval` cadences:
//! profiling, suppression and silence detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audio::codec::{UlawPacketizer, PCMU_FRAME_DURATION};
use crate::audio::noise::{NoiseSuppressor, SuppressionMode};
use crate::audio::silence::SilenceGate;
use crate::audio::spectrum::{volume_percent, SpectrumAnalyzer};
use crate::config::{NoiseConfig, SilenceConfig};
use crate::error::Result;
use crate::session::events::SessionEvent;

/// Where encoded outbound packets go; the published media track in practice.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn write_packet(&self, payload: Bytes, duration: Duration) -> Result<()>;
}

pub struct PublishProcessor {
    noise_analyzer: SpectrumAnalyzer,
    silence_analyzer: SpectrumAnalyzer,
    suppressor: NoiseSuppressor,
    gate: SilenceGate,
    mic_muted: bool,
}

impl PublishProcessor {
    pub fn new(noise: &NoiseConfig, silence: &SilenceConfig, now: Instant) -> Self {
        let mut suppressor = NoiseSuppressor::new(
            noise.mode,
            Duration::from_millis(noise.profile_duration_ms),
            now.into_std(),
        );
        if !noise.enabled {
            suppressor.set_enabled(false);
        }
        Self {
            noise_analyzer: SpectrumAnalyzer::new(noise.fft_size),
            silence_analyzer: SpectrumAnalyzer::new(silence.fft_size),
            suppressor,
            gate: SilenceGate::new(silence.threshold, silence.enabled),
            mic_muted: false,
        }
    }

    pub fn gate_mut(&mut self) -> &mut SilenceGate {
        &mut self.gate
    }

    pub fn suppressor(&self) -> &NoiseSuppressor {
        &self.suppressor
    }

    pub fn set_mic_muted(&mut self, muted: bool) {
        self.mic_muted = muted;
    }

    pub fn is_mic_muted(&self) -> bool {
        self.mic_muted
    }

    pub fn set_suppression(&mut self, enabled: bool) {
        self.suppressor.set_enabled(enabled);
    }

    pub fn set_mode(&mut self, mode: SuppressionMode) {
        self.suppressor.set_mode(mode);
    }

    pub fn restart_profiling(&mut self, now: Instant) {
        self.suppressor.restart_profiling(now.into_std());
    }

    pub fn set_silence_gate(&mut self, enabled: bool, threshold: u8) {
        self.gate.set_enabled(enabled);
        self.gate.set_threshold(threshold);
    }

    /// Feeds raw capture into both analyzers.
    pub fn analyze(&mut self, samples: &[f32]) {
        self.noise_analyzer.push_samples(samples);
        self.silence_analyzer.push_samples(samples);
    }

    /// Returns true when this tick finished the noise profile.
    pub fn profile_tick(&mut self, now: Instant) -> bool {
        if !self.suppressor.is_profiling() {
            return false;
        }
        let spectrum = self.noise_analyzer.byte_frequency_data();
        self.suppressor.profile_sample(spectrum, now.into_std())
    }

    pub fn suppression_tick(&mut self) -> f32 {
        if !self.suppressor.is_suppressing() {
            return self.suppressor.gain();
        }
        let spectrum = self.noise_analyzer.byte_frequency_data();
        self.suppressor.suppress(&spectrum)
    }

    /// Measures input volume; the gate fires its callback on a flip.
    pub fn silence_tick(&mut self) -> bool {
        let volume = volume_percent(&self.silence_analyzer.byte_frequency_data());
        self.gate.observe(volume)
    }

    /// Combined gain of every outbound stage.
    pub fn output_gain(&self) -> f32 {
        if self.mic_muted {
            return 0.0;
        }
        let noise = if self.suppressor.is_enabled() {
            self.suppressor.gain()
        } else {
            1.0
        };
        noise * self.gate.gain()
    }

    pub fn process(&self, samples: &mut [f32]) {
        let gain = self.output_gain();
        if gain == 1.0 {
            return;
        }
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }

    /// Switches to a new capture source: both analyzers forget the old
    /// audio and the noise profile is learned again.
    pub fn reattach(&mut self, now: Instant) {
        self.noise_analyzer.reset();
        self.silence_analyzer.reset();
        self.gate.reset();
        self.suppressor.restart_profiling(now.into_std());
    }
}

pub enum PipelineCommand {
    Reattach {
        capture: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    },
    SetMicMuted(bool),
    SetSuppression(bool),
    SetMode(SuppressionMode),
    RestartProfiling,
    SetSilenceGate { enabled: bool, threshold: u8 },
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineHandle {
    pub fn send(&self, command: PipelineCommand) {
        if self.tx.send(command).is_err() {
            debug!("publish pipeline has stopped");
        }
    }
}

pub struct PipelineSettings {
    pub noise: NoiseConfig,
    pub silence: SilenceConfig,
    pub sample_rate: u32,
}

pub fn spawn_pipeline(
    settings: PipelineSettings,
    capture: mpsc::Receiver<Vec<f32>>,
    sink: Arc<dyn PacketSink>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<PipelineHandle> {
    let (tx, mut commands) = mpsc::unbounded_channel();
    let mut packetizer = UlawPacketizer::new(settings.sample_rate)?;

    let mut processor = PublishProcessor::new(&settings.noise, &settings.silence, Instant::now());
    processor.gate_mut().on_change(move |silent, volume| {
        let _ = events.send(SessionEvent::SilenceChanged { silent, volume });
    });

    tokio::spawn(async move {
        let mut capture = Some(capture);

        let mut profile_ticker = ticker(settings.noise.profile_interval_ms);
        let mut suppress_ticker = ticker(settings.noise.interval_ms);
        let mut silence_ticker = ticker(settings.silence.interval_ms);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PipelineCommand::Reattach { capture: next, sample_rate }) => {
                        match UlawPacketizer::new(sample_rate) {
                            Ok(next_packetizer) => {
                                info!(sample_rate, "capture source switched");
                                capture = Some(next);
                                packetizer = next_packetizer;
                            }
                            Err(e) => {
                                warn!(sample_rate, "cannot use new capture source: {}", e);
                                capture = None;
                            }
                        }
                        processor.reattach(Instant::now());
                    }
                    Some(PipelineCommand::SetMicMuted(muted)) => processor.set_mic_muted(muted),
                    Some(PipelineCommand::SetSuppression(enabled)) => processor.set_suppression(enabled),
                    Some(PipelineCommand::SetMode(mode)) => processor.set_mode(mode),
                    Some(PipelineCommand::RestartProfiling) => processor.restart_profiling(Instant::now()),
                    Some(PipelineCommand::SetSilenceGate { enabled, threshold }) => {
                        processor.set_silence_gate(enabled, threshold)
                    }
                    None => break,
                },
                chunk = next_chunk(&mut capture) => match chunk {
                    Some(mut samples) => {
                        processor.analyze(&samples);
                        processor.process(&mut samples);
                        for packet in packetizer.push(&samples) {
                            if let Err(e) = sink.write_packet(Bytes::from(packet), PCMU_FRAME_DURATION).await {
                                debug!("outbound packet dropped: {}", e);
                            }
                        }
                    }
                    None => {
                        warn!("capture source ended");
                        capture = None;
                    }
                },
                _ = profile_ticker.tick() => {
                    if processor.profile_tick(Instant::now()) {
                        debug!("switching to suppression cadence");
                    }
                }
                _ = suppress_ticker.tick() => {
                    processor.suppression_tick();
                }
                _ = silence_ticker.tick() => {
                    processor.silence_tick();
                }
            }
        }
        debug!("publish pipeline finished");
    });

    Ok(PipelineHandle { tx })
}

fn ticker(ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_chunk(capture: &mut Option<mpsc::Receiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match capture {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn configs() -> (NoiseConfig, SilenceConfig) {
        let noise = NoiseConfig {
            profile_duration_ms: 200,
            fft_size: 256,
            ..NoiseConfig::default()
        };
        let silence = SilenceConfig {
            enabled: true,
            ..SilenceConfig::default()
        };
        (noise, silence)
    }

    /// Deterministic white noise in `[-amplitude, amplitude]`.
    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                amplitude * ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0)
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn mic_mute_zeroes_output() {
        let (noise, silence) = configs();
        let mut processor = PublishProcessor::new(&noise, &silence, Instant::now());
        processor.gate_mut().set_enabled(false);
        let mut samples = vec![0.5; 4];
        processor.process(&mut samples);
        assert_eq!(samples, vec![0.5; 4]);

        processor.set_mic_muted(true);
        processor.process(&mut samples);
        assert_eq!(samples, vec![0.0; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_input_is_gated_and_loud_input_opens_the_gate() {
        let (noise_config, silence) = configs();
        let mut processor = PublishProcessor::new(&noise_config, &silence, Instant::now());
        let flips = Arc::new(Mutex::new(Vec::new()));
        let sink = flips.clone();
        processor
            .gate_mut()
            .on_change(move |silent, _| sink.lock().unwrap().push(silent));

        processor.analyze(&[0.0; 256]);
        assert!(processor.silence_tick());
        assert_eq!(processor.output_gain(), 0.0);

        let loud = noise(256, 0.9);
        for _ in 0..10 {
            processor.analyze(&loud);
            processor.silence_tick();
        }
        assert!(!processor.gate_mut().is_silent());
        assert_eq!(*flips.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn profiling_hands_over_to_suppression() {
        let (noise_config, silence) = configs();
        let start = Instant::now();
        let mut processor = PublishProcessor::new(&noise_config, &silence, start);
        let background = noise(256, 0.05);

        let mut finished = false;
        for step in 1..=3u64 {
            processor.analyze(&background);
            finished = processor.profile_tick(start + Duration::from_millis(100 * step));
        }
        assert!(finished);
        assert!(processor.suppressor().is_suppressing());

        for _ in 0..20 {
            processor.analyze(&background);
            let gain = processor.suppression_tick();
            assert!((0.0..=1.0).contains(&gain));
        }

        // Re-learn once the analyzer has settled on the steady background.
        let later = start + Duration::from_secs(5);
        processor.restart_profiling(later);
        assert!(!processor.suppressor().is_suppressing());
        for step in 1..=3u64 {
            processor.analyze(&background);
            processor.profile_tick(later + Duration::from_millis(100 * step));
        }
        for _ in 0..40 {
            processor.analyze(&background);
            let gain = processor.suppression_tick();
            assert!((0.0..=1.0).contains(&gain));
        }
        assert!(processor.suppressor().gain() < 0.5);

        processor.reattach(later + Duration::from_secs(5));
        assert!(processor.suppressor().is_profiling());
        assert!(processor.gate_mut().is_silent());
    }

    struct CollectingSink(Mutex<Vec<Bytes>>);

    #[async_trait]
    impl PacketSink for CollectingSink {
        async fn write_packet(&self, payload: Bytes, _duration: Duration) -> Result<()> {
            self.0.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn muted_capture_reaches_the_sink_as_silence() {
        let (noise, silence) = configs();
        let settings = PipelineSettings {
            noise,
            silence,
            sample_rate: 8000,
        };
        let (capture_tx, capture_rx) = mpsc::channel(8);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let pipeline = spawn_pipeline(settings, capture_rx, sink.clone(), events_tx).unwrap();

        pipeline.send(PipelineCommand::SetMicMuted(true));
        tokio::time::sleep(Duration::from_millis(1)).await;
        capture_tx.send(vec![0.8; 160]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let packets = sink.0.lock().unwrap().clone();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].iter().all(|&b| b == 0xFF));
    }
}
