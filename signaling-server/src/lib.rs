//! Real-time presence and call-signaling broker.
//!
//! Clients hold one WebSocket each, announce who they are with `user-online`,
//! and from then on exchange call control, WebRTC negotiation and chat
//! notifications through the broker. Nothing here is persisted except the
//! best-effort presence mirror in the user store.

pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod protocol;
pub mod state;

pub type UserId = String;
pub type ConnId = String;

pub use config::{Args, BrokerConfig};
pub use error::BrokerError;
pub use http::serve;
pub use state::{AppState, SharedState};
