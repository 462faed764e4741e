//! Republishes the loopback mixer's output as its own outbound track.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::codec::{UlawPacketizer, PCMU_FRAME_DURATION};
use crate::audio::pipeline::PacketSink;
use crate::error::Result;

/// Averages each interleaved frame down to one channel.
pub fn downmix_to_mono(frame: &[f32], channels: usize) -> Vec<f32> {
    let channels = channels.max(1);
    if channels == 1 {
        return frame.to_vec();
    }
    frame
        .chunks_exact(channels)
        .map(|f| f.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Encodes every mixed buffer from `frames` (interleaved, `channels` wide,
/// at `sample_rate`) and writes the packets to `sink` until the mixer stops.
pub fn spawn_loopback_publisher(
    sample_rate: u32,
    channels: usize,
    mut frames: mpsc::Receiver<Vec<f32>>,
    sink: Arc<dyn PacketSink>,
) -> Result<JoinHandle<()>> {
    let mut packetizer = UlawPacketizer::new(sample_rate)?;
    Ok(tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let mono = downmix_to_mono(&frame, channels);
            for packet in packetizer.push(&mono) {
                if let Err(e) = sink.write_packet(Bytes::from(packet), PCMU_FRAME_DURATION).await {
                    warn!("loopback packet dropped: {}", e);
                }
            }
        }
        debug!("loopback publisher finished");
    }))
}
