use thiserror::Error;

use crate::state::calls::CallState;
use crate::UserId;

/// Refused call-signaling transitions. These are logged and dropped; they
/// never reach the client as an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("{user} is already in a call")]
    Busy { user: UserId },

    #[error("{user} tried to call themselves")]
    SelfCall { user: UserId },

    #[error("no pending call from {caller} to {callee}")]
    NoPendingCall { caller: UserId, callee: UserId },

    #[error("call between {a} and {b} is {actual:?}, expected {expected}")]
    WrongState {
        a: UserId,
        b: UserId,
        actual: CallState,
        expected: &'static str,
    },
}

/// Outbound queue failures for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("announce with user-online before sending {0}")]
    NotAnnounced(&'static str),

    #[error("connection is bound to {bound}, refusing message claiming to be {claimed}")]
    IdentityMismatch { bound: UserId, claimed: UserId },

    #[error("invalid message format: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http server error: {0}")]
    Http(#[from] hyper::Error),
}
