//! Peer-to-peer voice room client.
//!
//! Joins a room on a WebSocket relay, keeps one WebRTC audio session per
//! remote participant, mixes their audio for playback and publishes the
//! local microphone through noise suppression and a silence gate. Audio
//! from other local processes can be mixed and published as a second track.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod ice;
pub mod logging;
pub mod relay;
pub mod room;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use config::ClientConfig;
pub use error::{AppError, Result};
pub use session::Orchestrator;
