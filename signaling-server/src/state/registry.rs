use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::DeliveryError;
use crate::protocol::ServerMessage;
use crate::state::shard::Shards;
use crate::{ConnId, UserId};

/// The live, addressable end of one transport connection.
///
/// Cloning is cheap; clones share the same bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> &ConnId {
        &self.conn_id
    }

    /// Queues `msg` without waiting. A full queue drops the message.
    pub fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                warn!(
                    "Outbound queue full for connection {}, dropping {:?}",
                    self.conn_id, msg
                );
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

/// What a `register` call displaced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registration {
    /// Connection that previously served this user, now superseded.
    pub replaced: Option<ConnId>,
    /// User this connection was bound to before it re-announced as someone
    /// else; that user is no longer online.
    pub released: Option<UserId>,
}

/// Maps each online user to exactly one connection handle.
///
/// Lock order is connection shard, then entry shard. At most one entry
/// shard is held at a time.
pub struct ConnectionRegistry {
    entries: Shards<ConnectionHandle>,
    /// conn_id -> user_id, so a disconnect (which only knows its connection)
    /// can find its entry. A superseded connection keeps its binding until it
    /// closes; `remove` then sees the mismatch and leaves the entry alone.
    bindings: Shards<UserId>,
}

impl ConnectionRegistry {
    pub fn new(shards: usize) -> Self {
        Self {
            entries: Shards::new(shards),
            bindings: Shards::new(shards),
        }
    }

    /// User `conn_id` last announced as, if any.
    pub async fn bound_user(&self, conn_id: &str) -> Option<UserId> {
        self.bindings.lock(conn_id).await.get(conn_id).cloned()
    }

    /// Makes `handle` the only route to `user_id`. Last registration wins.
    pub async fn register(&self, user_id: &str, handle: ConnectionHandle) -> Registration {
        let conn_id = handle.conn_id().clone();
        let mut bindings = self.bindings.lock(&conn_id).await;
        let mut outcome = Registration::default();

        // Same connection re-announcing under a different identity.
        if let Some(previous_user) = bindings.get(&conn_id).cloned() {
            if previous_user != user_id {
                let mut shard = self.entries.lock(&previous_user).await;
                if shard.get(&previous_user).map(|h| h.conn_id()) == Some(&conn_id) {
                    shard.remove(&previous_user);
                    outcome.released = Some(previous_user);
                }
            }
        }

        let previous = {
            let mut shard = self.entries.lock(user_id).await;
            shard.insert(user_id.to_string(), handle)
        };

        if let Some(prev) = previous {
            if prev.conn_id() != &conn_id {
                info!(
                    "User {} reconnecting - replacing connection {} with {}",
                    user_id,
                    prev.conn_id(),
                    conn_id
                );
                outcome.replaced = Some(prev.conn_id().clone());
            }
        }
        bindings.insert(conn_id, user_id.to_string());

        outcome
    }

    /// Drops the entry owned by `conn_id`. Returns the user that went offline,
    /// or `None` when the connection was never registered or was already
    /// superseded by a newer registration.
    pub async fn remove(&self, conn_id: &str) -> Option<UserId> {
        let mut bindings = self.bindings.lock(conn_id).await;
        let user_id = bindings.remove(conn_id)?;

        let mut shard = self.entries.lock(&user_id).await;
        match shard.get(&user_id) {
            Some(current) if current.conn_id() == conn_id => {
                shard.remove(&user_id);
                Some(user_id)
            }
            _ => {
                debug!("Stale disconnect of {} for {} ignored", conn_id, user_id);
                None
            }
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.lock(user_id).await.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.entries.lock(user_id).await.contains_key(user_id)
    }

    /// Resolves the target's current handle and queues `msg` on it.
    /// Returns false when the user is offline or the message was dropped.
    pub async fn deliver(&self, user_id: &str, msg: ServerMessage) -> bool {
        let Some(handle) = self.lookup(user_id).await else {
            debug!("{} is offline, dropping {:?}", user_id, msg);
            return false;
        };
        handle.deliver(msg).is_ok()
    }

    /// Queues `msg` on every registered connection. Returns how many accepted it.
    pub async fn broadcast(&self, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for shard in self.entries.iter() {
            let handles: Vec<ConnectionHandle> = shard.lock().await.values().cloned().collect();
            for handle in handles {
                if handle.deliver(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for shard in self.entries.iter() {
            users.extend(shard.lock().await.keys().cloned());
        }
        users.sort();
        users
    }
}
