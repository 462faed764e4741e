use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::session::events::{SessionInput, TransportEvent, TransportEventKind};
use crate::session::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// The orchestrator only hears about states it acts on.
pub fn transport_event_for(state: ConnectionState) -> Option<TransportEventKind> {
    match state {
        ConnectionState::Connected => Some(TransportEventKind::Connected),
        ConnectionState::Disconnected => Some(TransportEventKind::Disconnected),
        ConnectionState::Failed => Some(TransportEventKind::Failed),
        ConnectionState::Closed => Some(TransportEventKind::Closed),
        ConnectionState::New | ConnectionState::Connecting => None,
    }
}

/// Watches one peer connection and reports its health to the orchestrator
/// inbox, tagged with the negotiator generation.
#[derive(Clone)]
pub struct ConnectionMonitor {
    peer_id: PeerId,
    generation: u64,
    events: mpsc::UnboundedSender<SessionInput>,
    last_state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionMonitor {
    pub fn new(peer_id: PeerId, generation: u64, events: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            peer_id,
            generation,
            events,
            last_state: Arc::new(Mutex::new(ConnectionState::New)),
        }
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        let state = ConnectionState::from(state);
        match self.last_state.lock() {
            Ok(last) if *last == state => return,
            Ok(mut last) => *last = state,
            Err(_) => return,
        }
        info!(peer_id = %self.peer_id, generation = self.generation, %state, "peer connection state changed");
        if let Some(kind) = transport_event_for(state) {
            self.report(kind);
        }
    }

    /// Signaling and ICE states are only logged; the peer connection state
    /// already covers what the orchestrator acts on.
    pub fn update_signaling_state(&self, state: RTCSignalingState) {
        debug!(peer_id = %self.peer_id, generation = self.generation, %state, "signaling state changed");
    }

    pub fn update_ice_state(&self, state: RTCIceConnectionState) {
        debug!(peer_id = %self.peer_id, generation = self.generation, %state, "ICE connection state changed");
    }

    /// Forwards a transport event for this negotiator. A closed inbox means
    /// the orchestrator is gone and the event no longer matters.
    pub fn report(&self, kind: TransportEventKind) {
        let _ = self.events.send(SessionInput::Transport(TransportEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            kind,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (ConnectionMonitor, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionMonitor::new("b".into(), 7, tx), rx)
    }

    #[test]
    fn connected_state_is_reported_with_generation() {
        let (monitor, mut rx) = monitor();
        monitor.update_peer_state(RTCPeerConnectionState::Connecting);
        monitor.update_peer_state(RTCPeerConnectionState::Connected);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionInput::Transport(TransportEvent {
                peer_id: "b".into(),
                generation: 7,
                kind: TransportEventKind::Connected,
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn repeated_states_are_reported_once() {
        let (monitor, mut rx) = monitor();
        monitor.update_peer_state(RTCPeerConnectionState::Failed);
        monitor.update_peer_state(RTCPeerConnectionState::Failed);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_the_last_state() {
        let (monitor, mut rx) = monitor();
        let callback_copy = monitor.clone();
        monitor.update_peer_state(RTCPeerConnectionState::Disconnected);
        callback_copy.update_peer_state(RTCPeerConnectionState::Disconnected);
        monitor.update_ice_state(RTCIceConnectionState::Checking);
        monitor.update_signaling_state(RTCSignalingState::HaveLocalOffer);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_actionable_states_become_events() {
        assert_eq!(transport_event_for(ConnectionState::Connecting), None);
        assert_eq!(
            transport_event_for(ConnectionState::Disconnected),
            Some(TransportEventKind::Disconnected)
        );
    }
}
