//! Binary transmit gate: outbound audio is muted while the input volume is
//! below a percentage threshold.

use tracing::debug;

type SilenceCallback = Box<dyn FnMut(bool, u8) + Send>;

pub struct SilenceGate {
    threshold: u8,
    enabled: bool,
    /// Nothing has been heard before the first measurement.
    silent: bool,
    volume: u8,
    on_change: Option<SilenceCallback>,
}

impl SilenceGate {
    pub fn new(threshold: u8, enabled: bool) -> Self {
        Self {
            threshold: threshold.min(100),
            enabled,
            silent: true,
            volume: 0,
            on_change: None,
        }
    }

    /// Called with `(is_silent, volume_percent)` whenever the flag flips.
    pub fn on_change(&mut self, callback: impl FnMut(bool, u8) + Send + 'static) {
        self.on_change = Some(Box::new(callback));
    }

    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold.min(100);
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Records one volume measurement and returns the silence flag.
    pub fn observe(&mut self, volume: u8) -> bool {
        self.volume = volume;
        let silent = volume < self.threshold;
        if silent != self.silent {
            self.silent = silent;
            debug!(silent, volume, "silence state changed");
            if let Some(callback) = self.on_change.as_mut() {
                callback(silent, volume);
            }
        }
        self.silent
    }

    /// Gain the gate applies to outbound audio.
    pub fn gain(&self) -> f32 {
        if self.enabled && self.silent {
            0.0
        } else {
            1.0
        }
    }

    /// Back to the unmeasured state, keeping threshold and callback.
    pub fn reset(&mut self) {
        self.silent = true;
        self.volume = 0;
    }
}
