use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::session::negotiator::Negotiator;
use crate::signaling::IceCandidate;

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// Produces the offer.
    Initiator,
    /// Waits for the remote offer and answers it.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Idle,
    Negotiating(NegotiationRole),
    Connected,
    Degraded,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Idle => write!(f, "Idle"),
            PeerState::Negotiating(NegotiationRole::Initiator) => write!(f, "Negotiating(initiator)"),
            PeerState::Negotiating(NegotiationRole::Responder) => write!(f, "Negotiating(responder)"),
            PeerState::Connected => write!(f, "Connected"),
            PeerState::Degraded => write!(f, "Degraded"),
            PeerState::Closed => write!(f, "Closed"),
        }
    }
}

/// How a roster event was learned, which decides who offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterOrigin {
    /// The peer was already in the room when we joined.
    Snapshot,
    /// The peer joined after us.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolePolicy {
    /// The newcomer offers to everyone already present.
    #[default]
    NewcomerOffers,
    /// The lexicographically lower peer id offers.
    LowerIdOffers,
}

impl RolePolicy {
    pub fn role_for(&self, local_id: &str, remote_id: &str, origin: RosterOrigin) -> NegotiationRole {
        match self {
            RolePolicy::NewcomerOffers => match origin {
                RosterOrigin::Snapshot => NegotiationRole::Initiator,
                RosterOrigin::Joined => NegotiationRole::Responder,
            },
            RolePolicy::LowerIdOffers => {
                if local_id < remote_id {
                    NegotiationRole::Initiator
                } else {
                    NegotiationRole::Responder
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub state: PeerState,
    pub role: NegotiationRole,
    pub last_activity: Instant,
}

/// Registry entry for one remote participant: the peer record plus the
/// negotiation resources the orchestrator owns for it.
pub struct PeerSession {
    pub peer: Peer,
    pub negotiator: Option<Arc<dyn Negotiator>>,
    /// Bumped for every new negotiator so late events from a discarded one
    /// can be recognised.
    pub generation: u64,
    pub remote_description_applied: bool,
    pub local_offer_pending: bool,
    pub pending_candidates: Vec<IceCandidate>,
    deadline: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(id: PeerId, display_name: String, role: NegotiationRole) -> Self {
        Self {
            peer: Peer {
                id,
                display_name,
                state: PeerState::Idle,
                role,
                last_activity: Instant::now(),
            },
            negotiator: None,
            generation: 0,
            remote_description_applied: false,
            local_offer_pending: false,
            pending_candidates: Vec::new(),
            deadline: None,
        }
    }

    /// Replaces the negotiation timer.
    pub fn arm_deadline(&mut self, timer: JoinHandle<()>) {
        self.disarm_deadline();
        self.deadline = Some(timer);
    }

    pub fn disarm_deadline(&mut self) {
        if let Some(timer) = self.deadline.take() {
            timer.abort();
        }
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn id(&self) -> &str {
        &self.peer.id
    }

    pub fn state(&self) -> PeerState {
        self.peer.state
    }

    pub fn touch(&mut self) {
        self.peer.last_activity = Instant::now();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.disarm_deadline();
    }
}
