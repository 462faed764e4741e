//! Client configuration.
//!
//! Loaded from a TOML file where every section is optional, then validated.
//! Durations are plain millisecond integers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::noise::SuppressionMode;
use crate::error::{AppError, Result};
use crate::session::peer::RolePolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub silence: SilenceConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    /// Mixer for foreign-process audio republished as a second track.
    #[serde(default)]
    pub loopback: MixerConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(raw).map_err(|e| AppError::config("<file>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.retry.max_retries) {
            return Err(AppError::config(
                "retry.max_retries",
                format!("{} is outside 1..=10", self.retry.max_retries),
            ));
        }
        if !(1000..=30_000).contains(&self.retry.retry_delay_ms) {
            return Err(AppError::config(
                "retry.retry_delay_ms",
                format!("{} is outside 1000..=30000", self.retry.retry_delay_ms),
            ));
        }
        if self.signaling.max_reconnect_attempts == 0 {
            return Err(AppError::config(
                "signaling.max_reconnect_attempts",
                "must be at least 1",
            ));
        }
        if self.silence.threshold > 100 {
            return Err(AppError::config(
                "silence.threshold",
                "percentage must be at most 100",
            ));
        }
        for (section, mixer) in [("mixer", &self.mixer), ("loopback", &self.loopback)] {
            mixer.validate(section)?;
        }
        for (field, ms) in [
            ("signaling.keepalive_interval_ms", self.signaling.keepalive_interval_ms),
            ("noise.profile_interval_ms", self.noise.profile_interval_ms),
            ("noise.interval_ms", self.noise.interval_ms),
            ("silence.interval_ms", self.silence.interval_ms),
            ("playback.analyzer_interval_ms", self.playback.analyzer_interval_ms),
            ("negotiation.timeout_ms", self.negotiation.timeout_ms),
            ("signaling.reconnect_delay_ms", self.signaling.reconnect_delay_ms),
        ] {
            if ms == 0 {
                return Err(AppError::config(field, "interval must be non-zero"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub room: String,
    pub keepalive_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            room: "lobby".to_string(),
            keepalive_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl SignalingConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Local identity. An empty `user_uuid` is replaced by a random one at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_uuid: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Endpoint returning short-lived relay credentials.
    pub credentials_url: Option<String>,
    pub fetch_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            credentials_url: None,
            fetch_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub role_policy: RolePolicy,
    /// A peer not connected this long after its negotiator opened counts
    /// as one failed attempt.
    pub timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            role_policy: RolePolicy::default(),
            timeout_ms: 10_000,
        }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub enabled: bool,
    pub mode: SuppressionMode,
    pub profile_duration_ms: u64,
    pub profile_interval_ms: u64,
    pub interval_ms: u64,
    pub fft_size: usize,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: SuppressionMode::Moderate,
            profile_duration_ms: 2_000,
            profile_interval_ms: 100,
            interval_ms: 50,
            fft_size: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    pub enabled: bool,
    /// Volume percentage below which input counts as silence.
    pub threshold: u8,
    pub interval_ms: u64,
    pub fft_size: usize,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 40,
            interval_ms: 100,
            fft_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub sample_rate: u32,
    pub channels: usize,
    pub max_queue_size: usize,
    /// Frames per rendered output buffer.
    pub frame_size: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            max_queue_size: 50,
            frame_size: 480,
        }
    }
}

impl MixerConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if !(1..=8).contains(&self.channels) {
            return Err(AppError::config(
                format!("{}.channels", section),
                format!("{} is outside 1..=8", self.channels),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(AppError::config(
                format!("{}.max_queue_size", section),
                "must be at least 1",
            ));
        }
        if self.frame_size == 0 || self.sample_rate == 0 {
            return Err(AppError::config(
                format!("{}.frame_size", section),
                "frame size and sample rate must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub volumes_path: Option<PathBuf>,
    pub speaking_threshold: u8,
    pub analyzer_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volumes_path: None,
            speaking_threshold: 5,
            analyzer_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}
