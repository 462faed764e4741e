use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::audio::playback::PlaybackSettings;
use crate::error::Result;
use crate::session::events::SessionInput;
use crate::session::peer::PeerId;
use crate::signaling::{IceCandidate, SessionDescription};

/// One point-to-point media session with a remote peer.
///
/// Implementations report health through the `events` sender handed to the
/// factory, tagged with the generation they were opened with.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Applies a remote offer and returns the applied local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Releases the session and everything attached to it. Safe to call twice.
    async fn close(&self) -> Result<()>;
}

pub struct NegotiatorContext {
    pub peer_id: PeerId,
    pub generation: u64,
    pub events: mpsc::UnboundedSender<SessionInput>,
    pub playback: watch::Receiver<PlaybackSettings>,
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn open(&self, ctx: NegotiatorContext) -> Result<Arc<dyn Negotiator>>;
}
