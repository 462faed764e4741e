//! Per-peer playback gain, the persisted volume table, and the speaking
//! indicator.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::session::peer::PeerId;

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.5;
pub const DEFAULT_GAIN: f32 = 1.0;

pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        return DEFAULT_GAIN;
    }
    gain.clamp(MIN_GAIN, MAX_GAIN)
}

/// What the decoding side of a remote track needs to know.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSettings {
    pub gain: f32,
    pub muted: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            muted: false,
        }
    }
}

impl PlaybackSettings {
    pub fn effective_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.gain
        }
    }

    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.effective_gain();
        if gain == 1.0 {
            return;
        }
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// Gain stage for one remote peer. The orchestrator owns it; the audio task
/// decoding the peer's track only holds the receiving end of the channel.
pub struct PlaybackControl {
    pub peer_id: PeerId,
    gain: f32,
    is_muted: bool,
    /// Deafen mutes every peer without touching their own mute flag.
    deafened: bool,
    speaking: SpeakingDetector,
    settings: watch::Sender<PlaybackSettings>,
}

impl PlaybackControl {
    pub fn new(peer_id: PeerId, gain: f32, deafened: bool, speaking_threshold: u8) -> Self {
        let gain = clamp_gain(gain);
        let (settings, _) = watch::channel(PlaybackSettings {
            gain,
            muted: deafened,
        });
        Self {
            peer_id,
            gain,
            is_muted: false,
            deafened,
            speaking: SpeakingDetector::new(speaking_threshold),
            settings,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSettings> {
        self.settings.subscribe()
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn settings(&self) -> PlaybackSettings {
        *self.settings.borrow()
    }

    /// Returns the gain actually applied.
    pub fn set_gain(&mut self, gain: f32) -> f32 {
        self.gain = clamp_gain(gain);
        self.publish();
        self.gain
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.is_muted = muted;
        self.publish();
    }

    pub fn set_deafened(&mut self, deafened: bool) {
        self.deafened = deafened;
        self.publish();
    }

    /// Feeds a volume sample; returns the new speaking flag when it flips.
    pub fn observe_level(&mut self, volume: u8) -> Option<bool> {
        self.speaking.observe(volume)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.is_speaking()
    }

    fn publish(&self) {
        self.settings.send_replace(PlaybackSettings {
            gain: self.gain,
            muted: self.is_muted || self.deafened,
        });
    }
}

/// Threshold detector behind the "speaking" indicator. Observational only.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold: u8,
    speaking: bool,
}

impl SpeakingDetector {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }

    pub fn observe(&mut self, volume: u8) -> Option<bool> {
        let speaking = volume > self.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

/// Per-peer gains remembered across sessions, stored as a JSON object keyed
/// by peer id. Without a path it only lives in memory.
#[derive(Debug, Default)]
pub struct VolumeStore {
    path: Option<PathBuf>,
    volumes: HashMap<PeerId, f32>,
}

#[derive(Serialize, Deserialize)]
struct VolumeFile {
    volumes: HashMap<PeerId, f32>,
}

impl VolumeStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A missing or unreadable file starts an empty table.
    pub fn open(path: PathBuf) -> Self {
        let volumes = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<VolumeFile>(&raw) {
                Ok(file) => file
                    .volumes
                    .into_iter()
                    .map(|(peer, gain)| (peer, clamp_gain(gain)))
                    .collect(),
                Err(e) => {
                    warn!(path = %path.display(), "ignoring malformed volume file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), "cannot read volume file: {}", e);
                HashMap::new()
            }
        };
        debug!(entries = volumes.len(), "volume store loaded");
        Self {
            path: Some(path),
            volumes,
        }
    }

    pub fn get(&self, peer_id: &str) -> f32 {
        self.volumes.get(peer_id).copied().unwrap_or(DEFAULT_GAIN)
    }

    pub fn set(&mut self, peer_id: &str, gain: f32) -> Result<()> {
        self.volumes.insert(peer_id.to_string(), clamp_gain(gain));
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = VolumeFile {
            volumes: self.volumes.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_is_clamped() {
        let mut control = PlaybackControl::new("b".into(), 1.0, false, 5);
        assert_eq!(control.set_gain(3.7), MAX_GAIN);
        assert_eq!(control.set_gain(-0.5), MIN_GAIN);
        assert_eq!(control.set_gain(f32::NAN), DEFAULT_GAIN);
        assert_eq!(control.set_gain(1.75), 1.75);
        assert_eq!(PlaybackControl::new("c".into(), 9.0, false, 5).gain(), MAX_GAIN);
    }

    #[test]
    fn mute_and_deafen_reach_the_subscriber() {
        let mut control = PlaybackControl::new("b".into(), 2.0, false, 5);
        let rx = control.subscribe();
        assert_eq!(rx.borrow().effective_gain(), 2.0);

        control.set_muted(true);
        assert_eq!(rx.borrow().effective_gain(), 0.0);
        control.set_muted(false);
        control.set_deafened(true);
        assert_eq!(rx.borrow().effective_gain(), 0.0);
        control.set_deafened(false);
        assert_eq!(rx.borrow().effective_gain(), 2.0);
        assert_eq!(control.gain(), 2.0);
    }

    #[test]
    fn settings_scale_samples() {
        let mut samples = [0.5, -0.25];
        PlaybackSettings { gain: 2.0, muted: false }.apply(&mut samples);
        assert_eq!(samples, [1.0, -0.5]);
        PlaybackSettings { gain: 2.0, muted: true }.apply(&mut samples);
        assert_eq!(samples, [0.0, 0.0]);
    }

    #[test]
    fn speaking_flips_only_on_threshold_crossings() {
        let mut detector = SpeakingDetector::new(5);
        assert_eq!(detector.observe(3), None);
        assert_eq!(detector.observe(20), Some(true));
        assert_eq!(detector.observe(30), None);
        assert_eq!(detector.observe(5), Some(false));
    }

    #[test]
    fn volumes_persist_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumes.json");

        let mut store = VolumeStore::open(path.clone());
        assert_eq!(store.get("b"), DEFAULT_GAIN);
        store.set("b", 1.8).unwrap();
        store.set("c", 7.0).unwrap();

        let reopened = VolumeStore::open(path);
        assert_eq!(reopened.get("b"), 1.8);
        assert_eq!(reopened.get("c"), MAX_GAIN);
    }

    #[test]
    fn malformed_volume_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumes.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(VolumeStore::open(path).get("b"), DEFAULT_GAIN);
    }
}
