use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::tungstenite::Message;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{CallerInfo, ConnectionHandle, MediaKind, SharedState};
use crate::{ConnId, UserId};

type WebSocket = hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>;

/// Per-connection view: who this socket speaks for.
pub struct Session {
    pub handle: ConnectionHandle,
    pub user_id: Option<UserId>,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle, user_id: None }
    }

    pub fn conn_id(&self) -> &ConnId {
        self.handle.conn_id()
    }

    /// The bound identity, checked against what the message claims.
    fn acting_as(&self, msg: &ClientMessage) -> Result<UserId, BrokerError> {
        let Some(bound) = &self.user_id else {
            return Err(BrokerError::NotAnnounced(msg.kind()));
        };
        let claimed = msg.claimed_sender();
        if claimed != bound {
            return Err(BrokerError::IdentityMismatch {
                bound: bound.clone(),
                claimed: claimed.to_string(),
            });
        }
        Ok(bound.clone())
    }
}

// ============================================
// WebSocket Connection Handler
// ============================================

pub async fn handle_connection(ws: WebSocket, addr: SocketAddr, state: SharedState) {
    info!("WebSocket connection established from {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();

    // Events from the broker are bounded; control frames (pongs) are not.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.outbound_buffer);
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let mut session = Session::new(ConnectionHandle::new(conn_id.clone(), tx));

    let ping_interval = state.config.ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(ping_interval);
        keepalive.tick().await;
        loop {
            let frame = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            error!("Failed to serialize {:?}: {}", event, e);
                            continue;
                        }
                    },
                    None => break,
                },
                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(frame) => frame,
                    None => break,
                },
                _ = keepalive.tick() => Message::Ping(Vec::new()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = state.config.idle_timeout;
    loop {
        tokio::select! {
            msg_result = tokio::time::timeout(idle_timeout, ws_receiver.next()) => {
                let msg_result = match msg_result {
                    Ok(msg_result) => msg_result,
                    Err(_) => {
                        info!("Client {} idle for {:?}, closing", addr, idle_timeout);
                        break;
                    }
                };
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => handle_message(msg, &mut session, &state).await,
                            Err(e) => Err(BrokerError::InvalidMessage(e)),
                        };
                        match outcome {
                            Ok(()) => {}
                            Err(BrokerError::Signaling(e)) => {
                                warn!("Ignoring out-of-order event on {}: {}", conn_id, e);
                            }
                            Err(e) => {
                                warn!("Error handling message from {}: {}", addr, e);
                                let _ = session.handle.deliver(ServerMessage::Error {
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ctrl_tx.send(Message::Pong(data));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => {
                break;
            }
        }
    }

    // Clean up when connection closes
    state.disconnect(&conn_id).await;
    send_task.abort();
    info!("Connection {} from {} closed", conn_id, addr);
}

pub async fn handle_message(
    msg: ClientMessage,
    session: &mut Session,
    state: &SharedState,
) -> Result<(), BrokerError> {
    if let ClientMessage::UserOnline { user_id } = msg {
        state.announce(&user_id, session.handle.clone()).await;
        session.user_id = Some(user_id);
        return Ok(());
    }

    let me = session.acting_as(&msg)?;

    match msg {
        ClientMessage::UserOnline { .. } => Ok(()),
        ClientMessage::CallRequest {
            to,
            caller_first_name,
            caller_last_name,
            caller_image,
            room_url,
            ..
        } => {
            info!("Call request from {} to {}", me, to);
            let metadata = CallerInfo {
                first_name: caller_first_name,
                last_name: caller_last_name,
                image: caller_image,
                room_url,
            };
            state.request_call(&me, &to, metadata).await?;
            Ok(())
        }
        ClientMessage::AcceptCall { to, .. } => {
            state.accept_call(&me, &to).await?;
            Ok(())
        }
        ClientMessage::RejectCall { to, .. } => {
            state.reject_call(&me, &to).await?;
            Ok(())
        }
        ClientMessage::CancelCall {
            to,
            caller_name,
            caller_image,
            ..
        } => {
            state.cancel_call(&me, &to, caller_name, caller_image).await?;
            Ok(())
        }
        ClientMessage::EndCall { to, .. } => {
            state.end_call(&me, &to).await?;
            Ok(())
        }
        ClientMessage::WebrtcOffer { to, offer, .. } => {
            state.relay_media(&me, &to, MediaKind::Offer, offer).await;
            Ok(())
        }
        ClientMessage::WebrtcAnswer { to, answer, .. } => {
            state.relay_media(&me, &to, MediaKind::Answer, answer).await;
            Ok(())
        }
        ClientMessage::WebrtcIceCandidate { to, candidate, .. } => {
            state.relay_media(&me, &to, MediaKind::IceCandidate, candidate).await;
            Ok(())
        }
        ClientMessage::SendMessage {
            receiver_id, message, ..
        } => {
            state.message_sent(&me, &receiver_id, message).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::state::tests::Client;
    use crate::state::{AppState, CallState, MemoryDirectory};
    use serde_json::json;
    use std::sync::Arc;

    fn parse(value: serde_json::Value) -> ClientMessage {
        serde_json::from_value(value).unwrap()
    }

    async fn announced(state: &SharedState, user: &str) -> (Session, Client) {
        let mut client = Client::new(&format!("conn-{}", user));
        let mut session = Session::new(client.handle.clone());
        let announce = json!({"type": "user-online", "userId": user});
        handle_message(parse(announce), &mut session, state)
            .await
            .unwrap();
        client.drain();
        (session, client)
    }

    #[tokio::test]
    async fn control_messages_require_announcement() {
        let state = AppState::new(BrokerConfig::default(), Arc::new(MemoryDirectory::new()));
        let client = Client::new("c");
        let mut session = Session::new(client.handle.clone());

        let err = handle_message(
            parse(json!({"type": "accept-call", "to": "alice", "from": "bob"})),
            &mut session,
            &state,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::NotAnnounced("accept-call")));
    }

    #[tokio::test]
    async fn spoofed_sender_is_refused() {
        let state = AppState::new(BrokerConfig::default(), Arc::new(MemoryDirectory::new()));
        let (mut mallory, _m) = announced(&state, "mallory").await;
        let (_bob, mut bob_client) = announced(&state, "bob").await;

        let err = handle_message(
            parse(json!({"type": "call-request", "to": "bob", "from": "alice"})),
            &mut mallory,
            &state,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BrokerError::IdentityMismatch { .. }));
        assert!(bob_client.drain().is_empty());
        assert_eq!(state.calls.state_of("alice", "bob").await, CallState::Idle);
    }

    #[tokio::test]
    async fn dispatches_call_flow_by_event_name() {
        let state = AppState::new(BrokerConfig::default(), Arc::new(MemoryDirectory::new()));
        let (mut alice, mut alice_client) = announced(&state, "alice").await;
        let (mut bob, mut bob_client) = announced(&state, "bob").await;
        alice_client.drain();

        handle_message(
            parse(json!({
                "type": "call-request",
                "to": "bob",
                "from": "alice",
                "callerFirstName": "Alice",
                "callerLastName": "Mensah",
                "callerImage": null,
            })),
            &mut alice,
            &state,
        )
        .await
        .unwrap();
        assert!(matches!(
            bob_client.drain().as_slice(),
            [ServerMessage::IncomingCall { caller_first_name, .. }] if caller_first_name == "Alice"
        ));

        let accept = json!({"type": "accept-call", "to": "alice", "from": "bob"});
        handle_message(parse(accept), &mut bob, &state).await.unwrap();
        assert_eq!(alice_client.drain(), vec![ServerMessage::CallAccepted { from: "bob".into() }]);

        handle_message(
            parse(json!({
                "type": "webrtc-offer",
                "to": "bob",
                "from": "alice",
                "offer": {"sdp": "v=0"},
            })),
            &mut alice,
            &state,
        )
        .await
        .unwrap();
        handle_message(
            parse(json!({
                "type": "webrtc-answer",
                "to": "alice",
                "from": "bob",
                "answer": {"sdp": "v=0"},
            })),
            &mut bob,
            &state,
        )
        .await
        .unwrap();
        assert_eq!(
            bob_client.drain(),
            vec![ServerMessage::WebrtcOffer {
                from: "alice".into(),
                offer: json!({"sdp": "v=0"})
            }]
        );
        assert_eq!(
            alice_client.drain(),
            vec![ServerMessage::WebrtcAnswer {
                from: "bob".into(),
                answer: json!({"sdp": "v=0"})
            }]
        );

        let end = json!({"type": "end-call", "to": "alice", "from": "bob"});
        handle_message(parse(end), &mut bob, &state).await.unwrap();
        assert_eq!(alice_client.drain(), vec![ServerMessage::CallEnded { from: "bob".into() }]);
    }

    #[tokio::test]
    async fn out_of_order_accept_surfaces_as_signaling_error() {
        let state = AppState::new(BrokerConfig::default(), Arc::new(MemoryDirectory::new()));
        let (_alice, mut alice_client) = announced(&state, "alice").await;
        let (mut bob, _b) = announced(&state, "bob").await;
        alice_client.drain();

        let accept = json!({"type": "accept-call", "to": "alice", "from": "bob"});
        let err = handle_message(parse(accept), &mut bob, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Signaling(_)));
        assert!(alice_client.drain().is_empty());
    }
}
