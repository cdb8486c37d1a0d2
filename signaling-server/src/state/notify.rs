use chrono::Utc;
use log::{debug, info, warn};

use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::UserId;

/// Who a new-message notification is from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSummary {
    pub sender_id: UserId,
    pub name: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedCall {
    pub caller_id: UserId,
    pub caller_name: String,
    pub caller_image: Option<String>,
}

impl AppState {
    /// Fire-and-forget: an offline receiver simply gets nothing, the message
    /// itself is already stored by the chat API.
    pub async fn notify_new_message(
        &self,
        receiver_id: &str,
        sender: SenderSummary,
        message: String,
    ) -> bool {
        let delivered = self
            .registry
            .deliver(
                receiver_id,
                ServerMessage::NewMessageNotification {
                    sender_id: sender.sender_id.clone(),
                    sender_name: sender.name,
                    sender_image: sender.image,
                    message,
                    timestamp: Utc::now(),
                },
            )
            .await;
        if delivered {
            info!("Sent message notification from {} to {}", sender.sender_id, receiver_id);
        }
        delivered
    }

    pub async fn notify_missed_call(&self, callee_id: &str, call: MissedCall) -> bool {
        let caller_id = call.caller_id.clone();
        let delivered = self
            .registry
            .deliver(
                callee_id,
                ServerMessage::MissedCallNotification {
                    caller_id: call.caller_id,
                    caller_name: call.caller_name,
                    caller_image: call.caller_image,
                    timestamp: Utc::now(),
                },
            )
            .await;
        if !delivered {
            debug!("Missed call from {} not delivered, {} offline", caller_id, callee_id);
        }
        delivered
    }

    /// `send-message`: looks up the sender's display identity and notifies the
    /// receiver if they are online.
    pub async fn message_sent(&self, sender_id: &str, receiver_id: &str, message: String) -> bool {
        if !self.registry.is_online(receiver_id).await {
            debug!("{} offline, skipping message notification", receiver_id);
            return false;
        }

        let sender = match self.directory.display_info(sender_id).await {
            Ok(Some(info)) => SenderSummary {
                sender_id: sender_id.to_string(),
                name: info.full_name(),
                image: info.picture_url(&self.config.api_base_url),
            },
            Ok(None) => SenderSummary {
                sender_id: sender_id.to_string(),
                name: sender_id.to_string(),
                image: None,
            },
            Err(e) => {
                warn!("Directory lookup for sender {} failed: {}", sender_id, e);
                SenderSummary {
                    sender_id: sender_id.to_string(),
                    name: sender_id.to_string(),
                    image: None,
                }
            }
        };

        self.notify_new_message(receiver_id, sender, message).await
    }
}
