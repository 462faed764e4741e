use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {field}: {message}")]
    Config { field: String, message: String },

    /// Microphone or speaker missing, denied or unusable. Blocks joining.
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation with {peer_id} failed: {message}")]
    Negotiation { peer_id: String, message: String },
}

impl AppError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn negotiation(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Negotiation {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
