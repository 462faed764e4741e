use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};

fn device_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Device(format!("{}: {}", context, e))
}

/// Default microphone, downmixed to mono `f32` chunks.
pub struct AudioCapture {
    _stream: cpal::Stream,
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Opens the default input device. Chunks that do not fit in `tx` are
    /// dropped in the device callback.
    pub fn open(tx: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AppError::Device("No input device available".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| device_error("input config", e))?;
        info!(
            device = %device.name().unwrap_or_default(),
            config = ?supported,
            "opening microphone"
        );

        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&device, &config, tx)?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(&device, &config, tx)?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(&device, &config, tx)?,
            sample_format => {
                return Err(AppError::Device(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )))
            }
        };
        stream.play().map_err(|e| device_error("start capture", e))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        let err_fn = |err| error!("input audio stream error: {}", err);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let _ = tx.try_send(downmix(data, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| device_error("build input stream", e))
    }
}

fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Default speaker, fed with interleaved frames from the mixer.
pub struct AudioOutput {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: usize,
}

impl AudioOutput {
    /// Opens the default output device and reports its format, which the
    /// mixer must render in.
    pub fn open(frames: mpsc::Receiver<Vec<f32>>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AppError::Device("No output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| device_error("output config", e))?;
        info!(
            device = %device.name().unwrap_or_default(),
            config = ?supported,
            "opening speaker"
        );

        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.config();
        let channels = config.channels.max(1) as usize;
        let stream = match supported.sample_format() {
            SampleFormat::F32 => Self::build_output_stream::<f32>(&device, &config, frames)?,
            SampleFormat::I16 => Self::build_output_stream::<i16>(&device, &config, frames)?,
            SampleFormat::U16 => Self::build_output_stream::<u16>(&device, &config, frames)?,
            sample_format => {
                return Err(AppError::Device(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )))
            }
        };
        stream.play().map_err(|e| device_error("start playback", e))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
            channels,
        })
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut frames: mpsc::Receiver<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let err_fn = |err| error!("output audio stream error: {}", err);
        let mut pending: VecDeque<f32> = VecDeque::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    while pending.len() < data.len() {
                        match frames.try_recv() {
                            Ok(frame) => pending.extend(frame),
                            Err(_) => break,
                        }
                    }
                    let underrun = data.len().saturating_sub(pending.len());
                    for out in data.iter_mut() {
                        *out = T::from_sample(pending.pop_front().unwrap_or(0.0));
                    }
                    if underrun > 0 && underrun < data.len() {
                        debug!(underrun, "playback underrun");
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| device_error("build output stream", e))
    }
}
