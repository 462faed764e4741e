//! Adaptive noise gate driven by a learned background spectrum.
//!
//! A profiling phase averages the byte spectrum into a [`NoiseProfile`].
//! Afterwards every tick measures how much of the current spectrum sits
//! within [`NOISE_TOLERANCE`] of that profile and eases the output gain
//! toward the mode's target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const NOISE_TOLERANCE: f32 = 15.0;
/// Profile length used when profiling collected nothing.
pub const EMPTY_PROFILE_BINS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionMode {
    Minimal,
    #[default]
    Moderate,
    Aggressive,
}

impl SuppressionMode {
    pub fn target_gain(self, noise_fraction: f32) -> f32 {
        match self {
            SuppressionMode::Minimal if noise_fraction > 0.7 => 0.7,
            SuppressionMode::Moderate if noise_fraction > 0.5 => 0.3,
            SuppressionMode::Aggressive if noise_fraction > 0.3 => 0.0,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseProfile {
    pub bins: Arc<[f32]>,
    pub captured_at: Instant,
}

impl NoiseProfile {
    /// Bin-wise arithmetic mean of the collected spectra.
    pub fn from_samples(samples: &[Vec<u8>], captured_at: Instant) -> Self {
        let Some(first) = samples.first() else {
            return Self {
                bins: vec![0.0; EMPTY_PROFILE_BINS].into(),
                captured_at,
            };
        };
        let mut sums = vec![0.0f32; first.len()];
        for spectrum in samples {
            for (sum, &level) in sums.iter_mut().zip(spectrum) {
                *sum += level as f32;
            }
        }
        let count = samples.len() as f32;
        Self {
            bins: sums.into_iter().map(|s| s / count).collect(),
            captured_at,
        }
    }

    /// Share of bins whose level is within tolerance of the profile.
    pub fn noise_fraction(&self, spectrum: &[u8]) -> f32 {
        if spectrum.is_empty() {
            return 0.0;
        }
        let matching = spectrum
            .iter()
            .enumerate()
            .filter(|&(i, &level)| {
                let noise = self.bins.get(i).copied().unwrap_or(0.0);
                (level as f32 - noise).abs() < NOISE_TOLERANCE
            })
            .count();
        matching as f32 / spectrum.len() as f32
    }
}

/// Blend speed for a gain change of `diff`; larger jumps move faster.
pub fn interpolation_speed(diff: f32) -> f32 {
    if diff > 0.7 {
        0.4
    } else if diff > 0.4 {
        0.25
    } else if diff > 0.2 {
        0.15
    } else {
        0.1
    }
}

#[derive(Debug)]
enum Phase {
    Profiling { started_at: Instant, spectra: Vec<Vec<u8>> },
    Suppressing,
}

#[derive(Debug)]
pub struct NoiseSuppressor {
    mode: SuppressionMode,
    enabled: bool,
    gain: f32,
    profile_duration: Duration,
    profile: Option<NoiseProfile>,
    phase: Phase,
}

impl NoiseSuppressor {
    /// Starts in the profiling phase.
    pub fn new(mode: SuppressionMode, profile_duration: Duration, now: Instant) -> Self {
        Self {
            mode,
            enabled: true,
            gain: 1.0,
            profile_duration,
            profile: None,
            phase: Phase::Profiling {
                started_at: now,
                spectra: Vec::new(),
            },
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn mode(&self) -> SuppressionMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_profiling(&self) -> bool {
        matches!(self.phase, Phase::Profiling { .. })
    }

    /// True when the periodic suppression tick should run.
    pub fn is_suppressing(&self) -> bool {
        self.enabled && matches!(self.phase, Phase::Suppressing)
    }

    pub fn profile(&self) -> Option<&NoiseProfile> {
        self.profile.as_ref()
    }

    pub fn set_mode(&mut self, mode: SuppressionMode) {
        info!(?mode, "noise suppression mode changed");
        self.mode = mode;
    }

    /// Disabling leaves the signal untouched; enabling resumes from unity gain.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.gain = 1.0;
        info!(enabled, "noise suppression toggled");
    }

    pub fn restart_profiling(&mut self, now: Instant) {
        debug!("noise profiling restarted");
        self.phase = Phase::Profiling {
            started_at: now,
            spectra: Vec::new(),
        };
    }

    /// Records one profiling spectrum. Returns true when this sample
    /// completed the profile.
    pub fn profile_sample(&mut self, spectrum: Vec<u8>, now: Instant) -> bool {
        let Phase::Profiling { started_at, spectra } = &mut self.phase else {
            return false;
        };
        spectra.push(spectrum);
        if now.duration_since(*started_at) <= self.profile_duration {
            return false;
        }

        let profile = NoiseProfile::from_samples(spectra, now);
        info!(bins = profile.bins.len(), samples = spectra.len(), "noise profile captured");
        self.profile = Some(profile);
        self.phase = Phase::Suppressing;
        true
    }

    /// Target gain for the given spectrum, before smoothing.
    pub fn target_gain(&self, spectrum: &[u8]) -> f32 {
        match &self.profile {
            Some(profile) => self.mode.target_gain(profile.noise_fraction(spectrum)),
            None => 1.0,
        }
    }

    /// One suppression tick. Returns the smoothed gain now in effect.
    pub fn suppress(&mut self, spectrum: &[u8]) -> f32 {
        if !self.is_suppressing() {
            return self.gain;
        }
        let target = self.target_gain(spectrum);
        self.apply_target(target)
    }

    fn apply_target(&mut self, target: f32) -> f32 {
        let speed = interpolation_speed((self.gain - target).abs());
        self.gain = (self.gain * (1.0 - speed) + target * speed).clamp(0.0, 1.0);
        self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiled(mode: SuppressionMode, noise: u8) -> (NoiseSuppressor, Instant) {
        let start = Instant::now();
        let mut ns = NoiseSuppressor::new(mode, Duration::from_millis(200), start);
        for step in 1..=3 {
            ns.profile_sample(vec![noise; 64], start + Duration::from_millis(100 * step));
        }
        assert!(!ns.is_profiling());
        (ns, start)
    }

    #[test]
    fn mode_targets() {
        assert_eq!(SuppressionMode::Minimal.target_gain(0.71), 0.7);
        assert_eq!(SuppressionMode::Minimal.target_gain(0.7), 1.0);
        assert_eq!(SuppressionMode::Moderate.target_gain(0.51), 0.3);
        assert_eq!(SuppressionMode::Moderate.target_gain(0.5), 1.0);
        assert_eq!(SuppressionMode::Aggressive.target_gain(0.31), 0.0);
        assert_eq!(SuppressionMode::Aggressive.target_gain(0.3), 1.0);
    }

    #[test]
    fn interpolation_speed_grows_with_the_jump() {
        assert_eq!(interpolation_speed(1.0), 0.4);
        assert_eq!(interpolation_speed(0.5), 0.25);
        assert_eq!(interpolation_speed(0.3), 0.15);
        assert_eq!(interpolation_speed(0.2), 0.1);
    }

    #[test]
    fn profile_is_the_binwise_mean() {
        let profile = NoiseProfile::from_samples(&[vec![10, 20], vec![30, 40]], Instant::now());
        assert_eq!(&*profile.bins, &[20.0, 30.0]);
        assert_eq!(profile.noise_fraction(&[25, 100]), 0.5);
        assert_eq!(profile.noise_fraction(&[20, 30, 14]), 1.0);
    }

    #[test]
    fn empty_profile_is_zeroed() {
        let profile = NoiseProfile::from_samples(&[], Instant::now());
        assert_eq!(profile.bins.len(), EMPTY_PROFILE_BINS);
        assert!(profile.bins.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn profiling_completes_after_the_window() {
        let start = Instant::now();
        let mut ns = NoiseSuppressor::new(SuppressionMode::Moderate, Duration::from_millis(200), start);
        assert!(!ns.profile_sample(vec![5; 8], start + Duration::from_millis(100)));
        assert!(!ns.profile_sample(vec![5; 8], start + Duration::from_millis(200)));
        assert!(ns.profile_sample(vec![5; 8], start + Duration::from_millis(300)));
        assert!(ns.is_suppressing());
        assert_eq!(ns.profile().unwrap().bins.len(), 8);
    }

    #[test]
    fn gain_converges_toward_target_and_stays_in_range() {
        let (mut ns, _) = profiled(SuppressionMode::Aggressive, 40);
        let noise = vec![40u8; 64];
        let mut previous = ns.gain();
        for _ in 0..60 {
            let gain = ns.suppress(&noise);
            assert!((0.0..=1.0).contains(&gain));
            assert!(gain <= previous);
            previous = gain;
        }
        assert!(previous < 0.01);

        let speech = vec![200u8; 64];
        for _ in 0..60 {
            let gain = ns.suppress(&speech);
            assert!((0.0..=1.0).contains(&gain));
            assert!(gain >= previous);
            previous = gain;
        }
        assert!(previous > 0.99);
    }

    #[test]
    fn first_step_of_a_large_jump_is_fast() {
        let (mut ns, _) = profiled(SuppressionMode::Aggressive, 40);
        let gain = ns.suppress(&vec![40u8; 64]);
        assert!((gain - 0.6).abs() < 1e-6);
    }

    #[test]
    fn disabling_restores_unity_and_stops_ticks() {
        let (mut ns, _) = profiled(SuppressionMode::Moderate, 40);
        ns.suppress(&vec![40u8; 64]);
        assert!(ns.gain() < 1.0);

        ns.set_enabled(false);
        assert_eq!(ns.gain(), 1.0);
        assert!(!ns.is_suppressing());
        assert_eq!(ns.suppress(&vec![40u8; 64]), 1.0);
    }

    #[test]
    fn reprofiling_replaces_the_profile_wholesale() {
        let (mut ns, start) = profiled(SuppressionMode::Moderate, 40);
        let old = ns.profile().unwrap().clone();

        let later = start + Duration::from_secs(10);
        ns.restart_profiling(later);
        assert!(ns.is_profiling());
        assert_eq!(ns.profile(), Some(&old));
        for step in 1..=3 {
            ns.profile_sample(vec![90; 32], later + Duration::from_millis(100 * step));
        }
        let new = ns.profile().unwrap();
        assert_eq!(new.bins.len(), 32);
        assert!(new.bins.iter().all(|&b| b == 90.0));
        assert_eq!(old.bins.len(), 64);
    }
}
