//! Byte magnitude spectrum in the style of a Web Audio `AnalyserNode`:
//! Blackman window, exponential smoothing between frames, and decibels
//! mapped linearly from `[min_db, max_db]` onto `0..=255`.

use std::collections::VecDeque;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const DEFAULT_MIN_DB: f32 = -100.0;
pub const DEFAULT_MAX_DB: f32 = -30.0;

pub struct SpectrumAnalyzer {
    fft_size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// `fft_size` must be a power of two of at least 32.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let window = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / fft_size as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: DEFAULT_SMOOTHING,
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
            window,
            fft,
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Appends mono samples; only the most recent `fft_size` are analysed.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &s in &samples[skip..] {
            self.history.pop_front();
            self.history.push_back(s);
        }
    }

    /// Forgets buffered audio and smoothing state, as after a source switch.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }

    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let mut windowed: Vec<f32> = self
            .history
            .iter()
            .zip(&self.window)
            .map(|(s, w)| s * w)
            .collect();
        let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); self.fft_size / 2 + 1];
        if self.fft.process(&mut windowed, &mut spectrum).is_err() {
            return vec![0; self.bin_count()];
        }

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_db - self.min_db;
        self.smoothed
            .iter_mut()
            .zip(&spectrum)
            .map(|(prev, c)| {
                let magnitude = c.norm() * scale;
                *prev = self.smoothing * *prev + (1.0 - self.smoothing) * magnitude;
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                (255.0 / range * (db - self.min_db)).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// Mean bin level as a rounded percentage of full scale.
pub fn volume_percent(spectrum: &[u8]) -> u8 {
    if spectrum.is_empty() {
        return 0;
    }
    let sum: u32 = spectrum.iter().map(|&b| b as u32).sum();
    let average = sum as f32 / spectrum.len() as f32;
    (average / 255.0 * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn silence_maps_to_zero() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        analyzer.push_samples(&[0.0; 256]);
        let data = analyzer.byte_frequency_data();
        assert_eq!(data.len(), 128);
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(volume_percent(&data), 0);
    }

    #[test]
    fn tone_peaks_near_its_bin() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        // 48 kHz / 256 = 187.5 Hz per bin; bin 16 is 3 kHz.
        let samples = tone(3000.0, 48_000.0, 256, 0.8);
        let mut data = Vec::new();
        for _ in 0..20 {
            analyzer.push_samples(&samples);
            data = analyzer.byte_frequency_data();
        }
        let peak = data
            .iter()
            .enumerate()
            .max_by_key(|&(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        assert!((15..=17).contains(&peak), "peak at bin {}", peak);
        assert!(data[peak] > 200);
        assert!(data[100] < data[peak]);
    }

    #[test]
    fn fft_size_is_rounded_to_a_power_of_two() {
        assert_eq!(SpectrumAnalyzer::new(300).fft_size(), 512);
        assert_eq!(SpectrumAnalyzer::new(2048).bin_count(), 1024);
    }

    #[test]
    fn volume_percent_rounds() {
        assert_eq!(volume_percent(&[255, 255]), 100);
        assert_eq!(volume_percent(&[102, 102]), 40);
        assert_eq!(volume_percent(&[]), 0);
    }
}
