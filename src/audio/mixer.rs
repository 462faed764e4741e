//! Multi-source mixer for per-process loopback audio and decoded remote
//! peers.
//!
//! Each source owns a bounded FIFO of interleaved `f32` chunks. Rendering
//! sums every source into a zeroed output buffer; output channel `c` reads
//! source channel `min(c, source_channels - 1)`, so mono sources fan out to
//! every output channel and wider sources are truncated.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MixerConfig;

/// Little-endian signed 16-bit PCM to `[-1.0, 1.0)`. A trailing odd byte is
/// ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

#[derive(Debug)]
pub struct MixerSource {
    pub source_id: String,
    pub channel_count: usize,
    queue: VecDeque<Vec<f32>>,
}

impl MixerSource {
    fn new(source_id: String, channel_count: usize) -> Self {
        Self {
            source_id,
            channel_count: channel_count.max(1),
            queue: VecDeque::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whole frames waiting in the queue.
    pub fn queued_frames(&self) -> usize {
        self.queue
            .iter()
            .map(|chunk| chunk.len() / self.channel_count)
            .sum()
    }

    /// Adds up to `frames` frames into `out`, consuming them from the queue.
    fn render_into(&mut self, out: &mut [f32], out_channels: usize, frames: usize) {
        let src_channels = self.channel_count;
        let mut frame = 0;
        while frame < frames {
            let Some(chunk) = self.queue.front_mut() else {
                break;
            };
            let chunk_frames = chunk.len() / src_channels;
            if chunk_frames == 0 {
                self.queue.pop_front();
                continue;
            }

            let take = chunk_frames.min(frames - frame);
            for f in 0..take {
                let dst = (frame + f) * out_channels;
                let src = f * src_channels;
                for c in 0..out_channels {
                    out[dst + c] += chunk[src + c.min(src_channels - 1)];
                }
            }
            frame += take;

            if take == chunk_frames {
                self.queue.pop_front();
            } else {
                chunk.drain(..take * src_channels);
            }
        }
    }
}

pub struct LoopbackMixer {
    channels: usize,
    max_queue_size: usize,
    sources: HashMap<String, MixerSource>,
}

impl LoopbackMixer {
    pub fn new(channels: usize, max_queue_size: usize) -> Self {
        Self {
            channels: channels.max(1),
            max_queue_size: max_queue_size.max(1),
            sources: HashMap::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Registers a mono source. No-op if it already exists.
    pub fn add_source(&mut self, source_id: &str) {
        self.add_source_with_channels(source_id, 1);
    }

    pub fn add_source_with_channels(&mut self, source_id: &str, channels: usize) {
        if self.sources.contains_key(source_id) {
            return;
        }
        info!(source_id, channels, "mixer source added");
        self.sources.insert(
            source_id.to_string(),
            MixerSource::new(source_id.to_string(), channels),
        );
    }

    /// Returns the source, creating a mono one on first sight.
    pub fn ensure_source(&mut self, source_id: &str) -> &mut MixerSource {
        self.sources.entry(source_id.to_string()).or_insert_with(|| {
            info!(source_id, "mixer source added");
            MixerSource::new(source_id.to_string(), 1)
        })
    }

    pub fn remove_source(&mut self, source_id: &str) {
        if self.sources.remove(source_id).is_some() {
            info!(source_id, "mixer source removed");
        }
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Decodes a PCM16 chunk and queues it for `source_id`.
    pub fn push_chunk(&mut self, source_id: &str, bytes: &[u8]) -> bool {
        let samples = decode_pcm16_le(bytes);
        self.push_samples(source_id, samples)
    }

    /// Queues interleaved samples. A chunk that does not hold whole frames
    /// for the source's channel count is rejected.
    pub fn push_samples(&mut self, source_id: &str, samples: Vec<f32>) -> bool {
        let max_queue_size = self.max_queue_size;
        let source = self.ensure_source(source_id);
        if samples.len() % source.channel_count != 0 {
            warn!(
                source_id,
                samples = samples.len(),
                channels = source.channel_count,
                "chunk is not a whole number of frames, rejected"
            );
            return false;
        }
        source.queue.push_back(samples);
        while source.queue.len() > max_queue_size {
            source.queue.pop_front();
            debug!(source_id, max_queue_size, "mixer queue full, dropped oldest chunk");
        }
        true
    }

    /// Renders `out.len() / channels` frames. The buffer is zeroed first.
    pub fn mix_into(&mut self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let frames = out.len() / self.channels;
        for source in self.sources.values_mut() {
            source.render_into(out, self.channels, frames);
        }
    }

    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.channels];
        self.mix_into(&mut out);
        out
    }

    pub fn queue_len(&self, source_id: &str) -> usize {
        self.sources.get(source_id).map_or(0, MixerSource::queue_len)
    }

    pub fn queued_frames(&self, source_id: &str) -> usize {
        self.sources.get(source_id).map_or(0, MixerSource::queued_frames)
    }

    pub fn has_pending_audio(&self) -> bool {
        self.sources.values().any(|s| !s.queue.is_empty())
    }
}

#[derive(Debug)]
pub enum MixerCommand {
    AddSource { source_id: String, channels: usize },
    RemoveSource { source_id: String },
    Chunk { source_id: String, bytes: Vec<u8> },
    Samples { source_id: String, samples: Vec<f32> },
}

/// Cloneable front end of a running mixer task.
#[derive(Debug, Clone)]
pub struct MixerHandle {
    tx: mpsc::UnboundedSender<MixerCommand>,
}

impl MixerHandle {
    pub fn add_source(&self, source_id: &str, channels: usize) {
        self.send(MixerCommand::AddSource {
            source_id: source_id.to_string(),
            channels,
        });
    }

    pub fn remove_source(&self, source_id: &str) {
        self.send(MixerCommand::RemoveSource {
            source_id: source_id.to_string(),
        });
    }

    pub fn push_chunk(&self, source_id: &str, bytes: Vec<u8>) {
        self.send(MixerCommand::Chunk {
            source_id: source_id.to_string(),
            bytes,
        });
    }

    pub fn push_samples(&self, source_id: &str, samples: Vec<f32>) {
        self.send(MixerCommand::Samples {
            source_id: source_id.to_string(),
            samples,
        });
    }

    fn send(&self, command: MixerCommand) {
        if self.tx.send(command).is_err() {
            debug!("mixer task has stopped");
        }
    }
}

/// Runs a mixer on its own task. Every frame period, if any source has
/// audio queued, one buffer of `frame_size` interleaved frames is offered
/// to `output`; a full output channel drops the buffer.
pub fn spawn_mixer(config: &MixerConfig, output: mpsc::Sender<Vec<f32>>) -> MixerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut mixer = LoopbackMixer::new(config.channels, config.max_queue_size);
    let frame_size = config.frame_size;
    let period = config.frame_period();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(MixerCommand::AddSource { source_id, channels }) => {
                        mixer.add_source_with_channels(&source_id, channels)
                    }
                    Some(MixerCommand::RemoveSource { source_id }) => mixer.remove_source(&source_id),
                    Some(MixerCommand::Chunk { source_id, bytes }) => {
                        mixer.push_chunk(&source_id, &bytes);
                    }
                    Some(MixerCommand::Samples { source_id, samples }) => {
                        mixer.push_samples(&source_id, samples);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !mixer.has_pending_audio() {
                        continue;
                    }
                    let frame = mixer.render(frame_size);
                    if output.try_send(frame).is_err() && output.is_closed() {
                        break;
                    }
                }
            }
        }
        debug!("mixer task finished");
    });

    MixerHandle { tx }
}
