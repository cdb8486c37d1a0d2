use log::{debug, warn};
use serde_json::Value;

use crate::protocol::ServerMessage;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Offer,
    Answer,
    IceCandidate,
}

impl MediaKind {
    /// Wraps an opaque payload in the outbound event for this kind.
    pub fn into_message(self, from: String, payload: Value) -> ServerMessage {
        match self {
            MediaKind::Offer => ServerMessage::WebrtcOffer { from, offer: payload },
            MediaKind::Answer => ServerMessage::WebrtcAnswer { from, answer: payload },
            MediaKind::IceCandidate => ServerMessage::WebrtcIceCandidate {
                from,
                candidate: payload,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Peer not connected (or its queue was full); dropped.
    PeerUnreachable,
    /// No accepted call between the two; dropped.
    NoActiveCall,
}

impl AppState {
    /// Forwards a session description or ICE candidate between the two ends of
    /// an accepted call. The payload is never inspected.
    pub async fn relay_media(
        &self,
        from: &str,
        to: &str,
        kind: MediaKind,
        payload: Value,
    ) -> RelayOutcome {
        if let Err(e) = self.calls.admit_media(from, to, kind).await {
            warn!("Dropping {:?} from {} to {}: {}", kind, from, to, e);
            return RelayOutcome::NoActiveCall;
        }

        debug!("Forwarding {:?} from {} to {}", kind, from, to);
        if self.registry.deliver(to, kind.into_message(from.to_string(), payload)).await {
            RelayOutcome::Delivered
        } else {
            RelayOutcome::PeerUnreachable
        }
    }
}
