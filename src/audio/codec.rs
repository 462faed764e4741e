//! G.711 µ-law glue between `f32` PCM and the 8 kHz PCMU sample track.

use std::time::Duration;

use rubato::{FftFixedIn, Resampler};
use tracing::warn;

use crate::error::{AppError, Result};

pub const PCMU_SAMPLE_RATE: u32 = 8000;
/// 20 ms at 8 kHz.
pub const PCMU_FRAME_SAMPLES: usize = 160;
pub const PCMU_FRAME_DURATION: Duration = Duration::from_millis(20);

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode_ulaw(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| linear_to_ulaw((s.clamp(-1.0, 1.0) * 32767.0) as i16))
        .collect()
}

pub fn decode_ulaw(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&b| ulaw_to_linear(b) as f32 / 32768.0)
        .collect()
}

/// Input chunk the FFT resampler works on: 10 ms at the source rate.
fn resampler_chunk(from_rate: u32) -> usize {
    (from_rate as usize / 100).max(1)
}

/// Streaming mono resampler over `rubato::FftFixedIn`.
///
/// The FFT resampler takes fixed-size input chunks, so samples are held
/// back until a whole chunk is available. Output is identical however the
/// input stream is split. Equal rates pass samples through untouched.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(AppError::Resample(format!(
                "cannot resample {} Hz to {} Hz",
                from_rate, to_rate
            )));
        }
        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                resampler_chunk(from_rate),
                1,
                1,
            )
            .map_err(|e| AppError::Resample(e.to_string()))?;
            Some(resampler)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Samples consumed per resampler step.
    pub fn input_chunk(&self) -> usize {
        self.inner.as_ref().map_or(1, |r| r.input_frames_next())
    }

    /// Samples produced per resampler step.
    pub fn output_chunk(&self) -> usize {
        self.inner.as_ref().map_or(1, |r| r.output_frames_next())
    }

    /// Input samples waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return input.to_vec();
        };
        self.pending.extend_from_slice(input);

        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }
            let chunk = &self.pending[consumed..consumed + needed];
            match resampler.process(&[chunk], None) {
                Ok(frames) => out.extend_from_slice(&frames[0]),
                Err(e) => warn!("resampling failed, chunk dropped: {}", e),
            }
            consumed += needed;
        }
        self.pending.drain(..consumed);
        out
    }
}

/// Turns captured mono audio into 20 ms PCMU payloads.
pub struct UlawPacketizer {
    resampler: StreamResampler,
    pending: Vec<f32>,
}

impl UlawPacketizer {
    pub fn new(input_rate: u32) -> Result<Self> {
        Ok(Self {
            resampler: StreamResampler::new(input_rate, PCMU_SAMPLE_RATE)?,
            pending: Vec::with_capacity(PCMU_FRAME_SAMPLES * 2),
        })
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        let resampled = self.resampler.process(samples);
        self.pending.extend_from_slice(&resampled);
        let mut packets = Vec::new();
        while self.pending.len() >= PCMU_FRAME_SAMPLES {
            let frame: Vec<f32> = self.pending.drain(..PCMU_FRAME_SAMPLES).collect();
            packets.push(encode_ulaw(&frame));
        }
        packets
    }
}
