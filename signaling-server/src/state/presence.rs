use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::{mpsc, MutexGuard};

use crate::protocol::ServerMessage;
use crate::state::directory::UserDirectory;
use crate::state::registry::ConnectionRegistry;
use crate::state::shard::Shards;
use crate::UserId;

/// The broker's belief about whether a user is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceFact {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// Exclusive right to change a user's presence. Held from the registry
/// mutation through the matching publish, so facts for one user go out in
/// the order the registry changed.
pub type PresenceGate<'a> = MutexGuard<'a, HashMap<String, bool>>;

/// Broadcasts presence changes and mirrors them into the user store.
///
/// The registry is authoritative; the store is a best-effort copy for the
/// REST side of the platform. Store writes go through one writer task so they
/// land in the order the broadcasts happened.
pub struct PresencePublisher {
    /// Last state published per user; the shard lock is the user's gate.
    published: Shards<bool>,
    mirror: mpsc::UnboundedSender<PresenceFact>,
}

impl PresencePublisher {
    /// Must be called inside a tokio runtime.
    pub fn new(shards: usize, directory: Arc<dyn UserDirectory>) -> Self {
        let (mirror, mut facts) = mpsc::unbounded_channel::<PresenceFact>();

        tokio::spawn(async move {
            while let Some(fact) = facts.recv().await {
                if let Err(e) = directory
                    .set_online_status(&fact.user_id, fact.is_online, fact.last_seen_at)
                    .await
                {
                    warn!("Failed to persist presence for {}: {}", fact.user_id, e);
                }
            }
        });

        Self {
            published: Shards::new(shards),
            mirror,
        }
    }

    /// Takes `user_id`'s gate. Lock order: gate first, then call and
    /// registry shards. Never take a second gate while holding one.
    pub async fn gate(&self, user_id: &str) -> PresenceGate<'_> {
        self.published.lock(user_id).await
    }

    pub async fn last_published(&self, user_id: &str) -> Option<bool> {
        self.published.lock(user_id).await.get(user_id).copied()
    }

    pub async fn publish(
        &self,
        gate: &mut PresenceGate<'_>,
        registry: &ConnectionRegistry,
        user_id: &str,
        is_online: bool,
    ) -> PresenceFact {
        let fact = PresenceFact {
            user_id: user_id.to_string(),
            is_online,
            last_seen_at: Utc::now(),
        };

        let msg = ServerMessage::UserStatusChange {
            user_id: fact.user_id.clone(),
            is_online,
        };
        let reached = registry.broadcast(&msg).await;
        debug!("Presence {} -> {} reached {} connections", user_id, is_online, reached);

        gate.insert(fact.user_id.clone(), is_online);
        if self.mirror.send(fact.clone()).is_err() {
            warn!("Presence mirror stopped; {} not persisted", user_id);
        }

        fact
    }
}
