use std::collections::HashMap;

use crate::session::peer::PeerId;
use crate::signaling::PeerInfo;

/// Membership of the room this client is in, as announced by the relay.
#[derive(Debug, Default)]
pub struct RoomState {
    name: Option<String>,
    members: HashMap<PeerId, PeerInfo>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to `room`, forgetting the members of any previous one.
    pub fn enter(&mut self, room: &str) {
        if self.name.as_deref() != Some(room) {
            self.members.clear();
        }
        self.name = Some(room.to_string());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.name.is_some()
    }

    /// Returns false when the peer was already a member.
    pub fn add_member(&mut self, peer: PeerInfo) -> bool {
        self.members.insert(peer.user_uuid.clone(), peer).is_none()
    }

    pub fn remove_member(&mut self, peer_id: &str) -> Option<PeerInfo> {
        self.members.remove(peer_id)
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members.contains_key(peer_id)
    }

    pub fn member(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.members.get(peer_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn clear(&mut self) {
        self.name = None;
        self.members.clear();
    }
}
