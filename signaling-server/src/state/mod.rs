pub mod backends;
pub mod calls;
pub mod directory;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod shard;

pub use calls::{CallState, CallTable, CallerInfo};
pub use directory::{DisplayInfo, MemoryDirectory, UserDirectory};
pub use presence::{PresenceGate, PresencePublisher};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use relay::{MediaKind, RelayOutcome};

use std::sync::Arc;

use log::info;

use crate::config::BrokerConfig;

/// Main broker state wrapping all subsystems.
/// Registry and call table are sharded internally, so unrelated users never
/// wait on each other.
pub struct AppState {
    pub config: BrokerConfig,
    pub registry: ConnectionRegistry,
    pub presence: PresencePublisher,
    pub calls: CallTable,
    pub directory: Arc<dyn UserDirectory>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Must be called inside a tokio runtime (the presence mirror task is
    /// spawned here).
    pub fn new(config: BrokerConfig, directory: Arc<dyn UserDirectory>) -> SharedState {
        Arc::new(Self {
            registry: ConnectionRegistry::new(config.shards),
            presence: PresencePublisher::new(config.shards, Arc::clone(&directory)),
            calls: CallTable::new(config.shards),
            directory,
            config,
        })
    }

    /// `user-online`: route `user_id` through `handle` from now on.
    ///
    /// Every presence transition runs under that user's gate, from the
    /// registry change to the broadcast.
    pub async fn announce(&self, user_id: &str, handle: ConnectionHandle) {
        let conn_id = handle.conn_id().clone();

        // Same connection switching identity: the old user leaves first.
        if let Some(previous) = self.registry.bound_user(&conn_id).await {
            if previous != user_id {
                let mut gate = self.presence.gate(&previous).await;
                if self.registry.remove(&conn_id).await.is_some() {
                    info!("Connection {} switched from {} to {}", conn_id, previous, user_id);
                    self.user_departed(&mut gate, &previous).await;
                }
            }
        }

        let mut gate = self.presence.gate(user_id).await;
        self.registry.register(user_id, handle).await;
        info!("User {} is now online (connection {})", user_id, conn_id);
        self.presence.publish(&mut gate, &self.registry, user_id, true).await;
    }

    /// Transport closed. No-op if this connection was already superseded.
    pub async fn disconnect(&self, conn_id: &str) {
        let Some(user_id) = self.registry.bound_user(conn_id).await else {
            return;
        };
        let mut gate = self.presence.gate(&user_id).await;
        if self.registry.remove(conn_id).await.is_some() {
            self.user_departed(&mut gate, &user_id).await;
        }
    }

    async fn user_departed(&self, gate: &mut PresenceGate<'_>, user_id: &str) {
        self.end_calls_for(user_id).await;
        info!("User {} is now offline", user_id);
        self.presence.publish(gate, &self.registry, user_id, false).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{DirectoryError, SignalingError};
    use crate::protocol::ServerMessage;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) struct Client {
        pub handle: ConnectionHandle,
        pub rx: mpsc::Receiver<ServerMessage>,
    }

    impl Client {
        pub fn new(conn_id: &str) -> Self {
            let (tx, rx) = mpsc::channel(32);
            Self {
                handle: ConnectionHandle::new(conn_id.to_string(), tx),
                rx,
            }
        }

        pub fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    async fn online(state: &SharedState, user: &str, conn: &str) -> Client {
        let mut client = Client::new(conn);
        state.announce(user, client.handle.clone()).await;
        client.drain();
        client
    }

    fn metadata() -> CallerInfo {
        CallerInfo {
            first_name: "Client".into(),
            last_name: "Supplied".into(),
            image: Some("http://cdn/client.png".into()),
            room_url: Some("https://rooms.example/abc".into()),
        }
    }

    async fn broker() -> (SharedState, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        directory
            .insert(
                "alice",
                DisplayInfo {
                    first_name: "Alice".into(),
                    last_name: "Mensah".into(),
                    picture_path: "alice.png".into(),
                },
            )
            .await;
        let state = AppState::new(BrokerConfig::default(), directory.clone());
        (state, directory)
    }

    #[tokio::test]
    async fn presence_fan_out_on_register_and_remove() {
        let (state, _) = broker().await;
        let mut watcher = online(&state, "watcher", "w").await;
        let mut other = online(&state, "other", "o").await;
        watcher.drain();

        let u = Client::new("u-conn");
        state.announce("u", u.handle.clone()).await;
        let online_msg = ServerMessage::UserStatusChange {
            user_id: "u".into(),
            is_online: true,
        };
        assert_eq!(watcher.drain(), vec![online_msg.clone()]);
        assert_eq!(other.drain(), vec![online_msg]);

        state.disconnect("u-conn").await;
        let offline_msg = ServerMessage::UserStatusChange {
            user_id: "u".into(),
            is_online: false,
        };
        assert_eq!(watcher.drain(), vec![offline_msg.clone()]);
        assert_eq!(other.drain(), vec![offline_msg]);
    }

    #[tokio::test]
    async fn stale_disconnect_publishes_nothing() {
        let (state, _) = broker().await;
        let mut watcher = online(&state, "watcher", "w").await;
        let _h1 = online(&state, "bob", "h1").await;
        let _h2 = online(&state, "bob", "h2").await;
        watcher.drain();

        state.disconnect("h1").await;
        assert!(watcher.drain().is_empty());
        assert!(state.registry.is_online("bob").await);
    }

    fn status(user: &str, is_online: bool) -> ServerMessage {
        ServerMessage::UserStatusChange {
            user_id: user.into(),
            is_online,
        }
    }

    #[tokio::test]
    async fn reconnect_during_departure_leaves_user_online() {
        let (state, _) = broker().await;
        let mut watcher = online(&state, "watcher", "w").await;
        let _c1 = online(&state, "u", "c1").await;
        watcher.drain();

        // Stall the departure between the registry removal and its broadcast.
        let held = state.calls.hold("u").await;
        let departing = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.disconnect("c1").await }
        });
        while state.registry.is_online("u").await {
            tokio::task::yield_now().await;
        }

        let c2 = Client::new("c2");
        let returning = tokio::spawn({
            let state = Arc::clone(&state);
            let handle = c2.handle.clone();
            async move { state.announce("u", handle).await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        drop(held);
        departing.await.unwrap();
        returning.await.unwrap();

        assert_eq!(watcher.drain(), vec![status("u", false), status("u", true)]);
        assert!(state.registry.is_online("u").await);
        assert_eq!(state.presence.last_published("u").await, Some(true));
    }

    #[tokio::test]
    async fn switching_identity_takes_old_user_offline_first() {
        let (state, _) = broker().await;
        let mut watcher = online(&state, "watcher", "w").await;
        let shared = online(&state, "alice", "shared").await;
        watcher.drain();

        state.announce("carol", shared.handle.clone()).await;

        assert_eq!(watcher.drain(), vec![status("alice", false), status("carol", true)]);
        assert!(!state.registry.is_online("alice").await);
        assert_eq!(state.registry.bound_user("shared").await.as_deref(), Some("carol"));

        state.disconnect("shared").await;
        assert_eq!(watcher.drain(), vec![status("carol", false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_is_mirrored_to_directory() {
        let (state, directory) = broker().await;
        let _u = online(&state, "u", "c").await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(directory.presence_of("u").await.unwrap().is_online);

        state.disconnect("c").await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!directory.presence_of("u").await.unwrap().is_online);
    }

    #[tokio::test]
    async fn call_round_trip_reaches_only_the_two_parties() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;
        let mut carol = online(&state, "carol", "c").await;
        alice.drain();
        bob.drain();

        assert_eq!(
            state.request_call("alice", "bob", metadata()).await.unwrap(),
            CallState::Ringing
        );
        assert_eq!(
            bob.drain(),
            vec![ServerMessage::IncomingCall {
                from: "alice".into(),
                caller_first_name: "Alice".into(),
                caller_last_name: "Mensah".into(),
                caller_image: Some("http://localhost:3001/assets/alice.png".into()),
                room_url: Some("https://rooms.example/abc".into()),
            }]
        );

        assert_eq!(state.accept_call("bob", "alice").await.unwrap(), CallState::Accepted);
        assert_eq!(alice.drain(), vec![ServerMessage::CallAccepted { from: "bob".into() }]);

        assert!(bob.drain().is_empty());
        assert!(carol.drain().is_empty());
    }

    #[tokio::test]
    async fn offline_callee_gets_user_offline_and_no_state() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;

        assert_eq!(state.request_call("alice", "bob", metadata()).await.unwrap(), CallState::Idle);
        assert_eq!(alice.drain(), vec![ServerMessage::UserOffline { user_id: "bob".into() }]);
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Idle);
        assert!(state.calls.attempt_of("alice").await.is_none());
    }

    #[tokio::test]
    async fn end_call_twice_delivers_once() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        state.accept_call("bob", "alice").await.unwrap();
        alice.drain();
        bob.drain();

        state.end_call("alice", "bob").await.unwrap();
        state.end_call("alice", "bob").await.unwrap();
        assert_eq!(bob.drain(), vec![ServerMessage::CallEnded { from: "alice".into() }]);
    }

    #[tokio::test]
    async fn reject_and_out_of_order_accept() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;
        alice.drain();

        assert!(matches!(
            state.accept_call("bob", "alice").await,
            Err(SignalingError::NoPendingCall { .. })
        ));
        assert!(alice.drain().is_empty());

        state.request_call("alice", "bob", metadata()).await.unwrap();
        bob.drain();
        state.reject_call("bob", "alice").await.unwrap();
        assert_eq!(alice.drain(), vec![ServerMessage::CallRejected { from: "bob".into() }]);
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Idle);
    }

    #[tokio::test]
    async fn busy_callee_signals_second_caller() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;
        let mut carol = online(&state, "carol", "c").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        bob.drain();
        carol.drain();

        state.request_call("carol", "bob", metadata()).await.unwrap();
        assert_eq!(carol.drain(), vec![ServerMessage::UserBusy { user_id: "bob".into() }]);
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn cancel_sends_missed_call_with_supplied_name() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        bob.drain();
        state
            .cancel_call("alice", "bob", Some("Alice M.".into()), None)
            .await
            .unwrap();

        match bob.drain().as_slice() {
            [ServerMessage::MissedCallNotification {
                caller_id,
                caller_name,
                caller_image,
                ..
            }] => {
                assert_eq!(caller_id, "alice");
                assert_eq!(caller_name, "Alice M.");
                assert_eq!(caller_image.as_deref(), Some("http://localhost:3001/assets/alice.png"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // second cancel has nothing to cancel
        assert!(state.cancel_call("alice", "bob", None, None).await.is_err());
        assert!(bob.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ring_times_out_on_the_server() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;
        alice.drain();

        state.request_call("alice", "bob", metadata()).await.unwrap();
        bob.drain();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Idle);
        assert_eq!(alice.drain(), vec![ServerMessage::CallTimeout { user_id: "bob".into() }]);
        match bob.drain().as_slice() {
            [ServerMessage::MissedCallNotification { caller_name, .. }] => {
                assert_eq!(caller_name, "Alice Mensah")
            }
            other => panic!("unexpected {:?}", other),
        }

        // late client-side cancel is a no-op
        assert!(state.cancel_call("alice", "bob", None, None).await.is_err());
        assert!(bob.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_call_is_not_timed_out() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let _bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        state.accept_call("bob", "alice").await.unwrap();
        alice.drain();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Accepted);
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn callee_reconnect_while_ringing_uses_new_handle() {
        let (state, _) = broker().await;
        let mut alice = online(&state, "alice", "a").await;
        let mut h1 = online(&state, "bob", "h1").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        assert!(matches!(
            h1.drain().as_slice(),
            [ServerMessage::IncomingCall { from, .. }] if from == "alice"
        ));

        let mut h2 = online(&state, "bob", "h2").await;
        state.disconnect("h1").await;
        alice.drain();

        state.accept_call("bob", "alice").await.unwrap();
        assert_eq!(alice.drain(), vec![ServerMessage::CallAccepted { from: "bob".into() }]);

        let offer = json!({"type": "offer", "sdp": "v=0"});
        assert_eq!(
            state.relay_media("alice", "bob", MediaKind::Offer, offer.clone()).await,
            RelayOutcome::Delivered
        );
        assert_eq!(
            h2.drain(),
            vec![ServerMessage::WebrtcOffer {
                from: "alice".into(),
                offer
            }]
        );
        assert!(h1.drain().is_empty());
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Negotiating);
    }

    #[tokio::test]
    async fn disconnect_mid_call_notifies_survivor() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        state.accept_call("bob", "alice").await.unwrap();
        state
            .relay_media("alice", "bob", MediaKind::Offer, json!({"sdp": "x"}))
            .await;
        bob.drain();

        state.disconnect("a").await;
        assert_eq!(
            bob.drain(),
            vec![
                ServerMessage::CallEnded { from: "alice".into() },
                ServerMessage::UserStatusChange {
                    user_id: "alice".into(),
                    is_online: false
                },
            ]
        );
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Idle);
    }

    #[tokio::test]
    async fn accept_after_caller_left_ends_the_call() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        state.disconnect("a").await;
        bob.drain();

        assert_eq!(state.accept_call("bob", "alice").await.unwrap(), CallState::Idle);
        assert_eq!(bob.drain(), vec![ServerMessage::CallEnded { from: "alice".into() }]);
        assert!(state.calls.attempt_of("bob").await.is_none());
    }

    #[tokio::test]
    async fn relay_without_call_is_dropped() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        assert_eq!(
            state
                .relay_media("alice", "bob", MediaKind::IceCandidate, json!({"candidate": "c"}))
                .await,
            RelayOutcome::NoActiveCall
        );
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn relay_to_vanished_peer_is_silent() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let bob = online(&state, "bob", "b").await;
        state.request_call("alice", "bob", metadata()).await.unwrap();
        state.accept_call("bob", "alice").await.unwrap();

        // bob's transport is gone but the disconnect has not been processed yet
        drop(bob);
        assert_eq!(
            state.relay_media("alice", "bob", MediaKind::Offer, json!({})).await,
            RelayOutcome::PeerUnreachable
        );
    }

    #[tokio::test]
    async fn message_notification_to_offline_receiver_is_dropped() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        assert!(!state.message_sent("alice", "x", "hello".into()).await);
    }

    #[tokio::test]
    async fn message_notification_carries_sender_identity() {
        let (state, _) = broker().await;
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        assert!(state.message_sent("alice", "bob", "Your results are in".into()).await);
        match bob.drain().as_slice() {
            [ServerMessage::NewMessageNotification {
                sender_id,
                sender_name,
                sender_image,
                message,
                ..
            }] => {
                assert_eq!(sender_id, "alice");
                assert_eq!(sender_name, "Alice Mensah");
                assert_eq!(sender_image.as_deref(), Some("http://localhost:3001/assets/alice.png"));
                assert_eq!(message, "Your results are in");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl UserDirectory for BrokenDirectory {
        async fn display_info(
            &self,
            _user_id: &str,
        ) -> Result<Option<DisplayInfo>, DirectoryError> {
            Err(DirectoryError::Unavailable("connection refused".into()))
        }

        async fn set_online_status(
            &self,
            _user_id: &str,
            _is_online: bool,
            _last_seen_at: DateTime<Utc>,
        ) -> Result<(), DirectoryError> {
            Err(DirectoryError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn failing_directory_falls_back_to_client_metadata() {
        let state = AppState::new(BrokerConfig::default(), Arc::new(BrokenDirectory));
        let _alice = online(&state, "alice", "a").await;
        let mut bob = online(&state, "bob", "b").await;

        state.request_call("alice", "bob", metadata()).await.unwrap();
        assert_eq!(
            bob.drain(),
            vec![ServerMessage::IncomingCall {
                from: "alice".into(),
                caller_first_name: "Client".into(),
                caller_last_name: "Supplied".into(),
                caller_image: Some("http://cdn/client.png".into()),
                room_url: Some("https://rooms.example/abc".into()),
            }]
        );

        assert!(state.message_sent("alice", "bob", "hi".into()).await);
        assert!(matches!(
            bob.drain().as_slice(),
            [ServerMessage::NewMessageNotification {
                sender_name,
                sender_image: None,
                ..
            }] if sender_name == "alice"
        ));
    }
}
