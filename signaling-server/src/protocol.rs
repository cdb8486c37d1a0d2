use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::UserId;

// ============================================
// Client -> Broker
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Binds this connection to a user and marks them online.
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: UserId },

    /// Caller asks the broker to ring the callee. The caller fields are only
    /// a fallback; the directory's record wins.
    #[serde(rename_all = "camelCase")]
    CallRequest {
        to: UserId,
        from: UserId,
        #[serde(default)]
        caller_first_name: String,
        #[serde(default)]
        caller_last_name: String,
        #[serde(default)]
        caller_image: Option<String>,
        #[serde(default)]
        room_url: Option<String>,
    },

    /// Callee (`from`) accepts the ring from the caller (`to`).
    AcceptCall { to: UserId, from: UserId },

    /// Callee (`from`) declines the ring from the caller (`to`).
    RejectCall { to: UserId, from: UserId },

    /// Caller abandons a ring that was never answered.
    #[serde(rename_all = "camelCase")]
    CancelCall {
        to: UserId,
        from: UserId,
        #[serde(default)]
        caller_name: Option<String>,
        #[serde(default)]
        caller_image: Option<String>,
    },

    EndCall { to: UserId, from: UserId },

    WebrtcOffer { to: UserId, from: UserId, offer: Value },

    WebrtcAnswer { to: UserId, from: UserId, answer: Value },

    WebrtcIceCandidate {
        to: UserId,
        from: UserId,
        candidate: Value,
    },

    /// The chat message itself is already persisted by the REST API; this
    /// only triggers the live notification.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        sender_id: UserId,
        receiver_id: UserId,
        message: String,
    },
}

impl ClientMessage {
    /// Event name as it appears on the wire, for log lines and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::UserOnline { .. } => "user-online",
            ClientMessage::CallRequest { .. } => "call-request",
            ClientMessage::AcceptCall { .. } => "accept-call",
            ClientMessage::RejectCall { .. } => "reject-call",
            ClientMessage::CancelCall { .. } => "cancel-call",
            ClientMessage::EndCall { .. } => "end-call",
            ClientMessage::WebrtcOffer { .. } => "webrtc-offer",
            ClientMessage::WebrtcAnswer { .. } => "webrtc-answer",
            ClientMessage::WebrtcIceCandidate { .. } => "webrtc-ice-candidate",
            ClientMessage::SendMessage { .. } => "send-message",
        }
    }

    /// The identity the client claims to act as.
    pub fn claimed_sender(&self) -> &str {
        match self {
            ClientMessage::UserOnline { user_id } => user_id,
            ClientMessage::CallRequest { from, .. }
            | ClientMessage::AcceptCall { from, .. }
            | ClientMessage::RejectCall { from, .. }
            | ClientMessage::CancelCall { from, .. }
            | ClientMessage::EndCall { from, .. }
            | ClientMessage::WebrtcOffer { from, .. }
            | ClientMessage::WebrtcAnswer { from, .. }
            | ClientMessage::WebrtcIceCandidate { from, .. } => from,
            ClientMessage::SendMessage { sender_id, .. } => sender_id,
        }
    }
}

// ============================================
// Broker -> Client
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Broadcast to every connection on register/remove.
    #[serde(rename_all = "camelCase")]
    UserStatusChange { user_id: UserId, is_online: bool },

    #[serde(rename_all = "camelCase")]
    IncomingCall {
        from: UserId,
        caller_first_name: String,
        caller_last_name: String,
        caller_image: Option<String>,
        room_url: Option<String>,
    },

    /// The requested callee has no live connection.
    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: UserId },

    /// The named party is already engaged in another call attempt.
    #[serde(rename_all = "camelCase")]
    UserBusy { user_id: UserId },

    CallAccepted { from: UserId },

    CallRejected { from: UserId },

    CallEnded { from: UserId },

    /// Ring timed out on the broker before the callee answered.
    #[serde(rename_all = "camelCase")]
    CallTimeout { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    MissedCallNotification {
        caller_id: UserId,
        caller_name: String,
        caller_image: Option<String>,
        timestamp: DateTime<Utc>,
    },

    WebrtcOffer { from: UserId, offer: Value },

    WebrtcAnswer { from: UserId, answer: Value },

    WebrtcIceCandidate { from: UserId, candidate: Value },

    #[serde(rename_all = "camelCase")]
    NewMessageNotification {
        sender_id: UserId,
        sender_name: String,
        sender_image: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Error message from the broker
    Error { message: String },
}
