use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::error::SignalingError;
use crate::protocol::ServerMessage;
use crate::state::notify::MissedCall;
use crate::state::relay::MediaKind;
use crate::state::shard::Shards;
use crate::state::AppState;
use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Accepted,
    Negotiating,
}

/// Caller identity as sent by the client in `call-request`. Only used where
/// the directory has nothing better.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub first_name: String,
    pub last_name: String,
    pub image: Option<String>,
    pub room_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAttempt {
    pub id: u64,
    pub caller: UserId,
    pub callee: UserId,
    pub state: CallState,
    pub started_at: Instant,
    pub caller_info: CallerInfo,
}

impl CallAttempt {
    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.caller == a && self.callee == b) || (self.caller == b && self.callee == a)
    }

    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller == user_id {
            &self.callee
        } else {
            &self.caller
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, CallState::Accepted | CallState::Negotiating)
    }
}

/// Result of `CallTable::begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingStart {
    Started(CallAttempt),
    /// Same caller re-requested the same callee while still ringing.
    Restarted(CallAttempt),
}

impl RingStart {
    pub fn attempt(&self) -> &CallAttempt {
        match self {
            RingStart::Started(a) | RingStart::Restarted(a) => a,
        }
    }
}

/// Every live call attempt, stored under both participants so a user can be
/// checked for engagement with a single lookup. A user takes part in at most
/// one attempt at a time.
///
/// Each transition locks the shards of both parties, which linearizes it
/// against every other transition touching either of them.
pub struct CallTable {
    slots: Shards<CallAttempt>,
    next_id: AtomicU64,
}

impl CallTable {
    pub fn new(shards: usize) -> Self {
        Self {
            slots: Shards::new(shards),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn state_of(&self, a: &str, b: &str) -> CallState {
        match self.slots.lock(a).await.get(a) {
            Some(attempt) if attempt.involves(a, b) => attempt.state,
            _ => CallState::Idle,
        }
    }

    pub async fn attempt_of(&self, user_id: &str) -> Option<CallAttempt> {
        self.slots.lock(user_id).await.get(user_id).cloned()
    }

    /// Idle -> Ringing.
    pub async fn begin(
        &self,
        caller: &str,
        callee: &str,
        caller_info: CallerInfo,
    ) -> Result<RingStart, SignalingError> {
        if caller == callee {
            return Err(SignalingError::SelfCall { user: caller.to_string() });
        }

        let mut pair = self.slots.lock_pair(caller, callee).await;

        let restart = match pair.b().get(callee) {
            Some(existing) if existing.caller == caller && existing.state == CallState::Ringing => {
                true
            }
            Some(_) => return Err(SignalingError::Busy { user: callee.to_string() }),
            None => false,
        };
        if !restart && pair.a().contains_key(caller) {
            return Err(SignalingError::Busy { user: caller.to_string() });
        }

        let attempt = CallAttempt {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            caller: caller.to_string(),
            callee: callee.to_string(),
            state: CallState::Ringing,
            started_at: Instant::now(),
            caller_info,
        };
        pair.a().insert(caller.to_string(), attempt.clone());
        pair.b().insert(callee.to_string(), attempt.clone());

        Ok(if restart {
            RingStart::Restarted(attempt)
        } else {
            RingStart::Started(attempt)
        })
    }

    /// Ringing -> Accepted.
    pub async fn accept(&self, callee: &str, caller: &str) -> Result<CallAttempt, SignalingError> {
        self.advance_ringing(caller, callee, Some(CallState::Accepted)).await
    }

    /// Ringing -> Idle, by the callee.
    pub async fn reject(&self, callee: &str, caller: &str) -> Result<CallAttempt, SignalingError> {
        self.advance_ringing(caller, callee, None).await
    }

    /// Ringing -> Idle, by the caller.
    pub async fn cancel(&self, caller: &str, callee: &str) -> Result<CallAttempt, SignalingError> {
        self.advance_ringing(caller, callee, None).await
    }

    /// Ringing -> Idle on ring timeout. Only applies to attempt `id`; a timer
    /// left over from an earlier attempt returns `None`.
    pub async fn expire(&self, caller: &str, callee: &str, id: u64) -> Option<CallAttempt> {
        let mut pair = self.slots.lock_pair(caller, callee).await;
        match pair.b().get(callee) {
            Some(a) if a.id == id && a.state == CallState::Ringing => {}
            _ => return None,
        }
        pair.a().remove(caller);
        pair.b().remove(callee)
    }

    /// Is attempt `id` still ringing?
    pub async fn is_ringing(&self, callee: &str, id: u64) -> bool {
        matches!(
            self.slots.lock(callee).await.get(callee),
            Some(a) if a.id == id && a.state == CallState::Ringing
        )
    }

    async fn advance_ringing(
        &self,
        caller: &str,
        callee: &str,
        next: Option<CallState>,
    ) -> Result<CallAttempt, SignalingError> {
        let mut pair = self.slots.lock_pair(caller, callee).await;

        let current = match pair.b().get(callee) {
            Some(a) if a.caller == caller && a.callee == callee => a.clone(),
            _ => {
                return Err(SignalingError::NoPendingCall {
                    caller: caller.to_string(),
                    callee: callee.to_string(),
                })
            }
        };
        if current.state != CallState::Ringing {
            return Err(SignalingError::WrongState {
                a: caller.to_string(),
                b: callee.to_string(),
                actual: current.state,
                expected: "Ringing",
            });
        }

        match next {
            Some(state) => {
                let mut updated = current;
                updated.state = state;
                pair.a().insert(caller.to_string(), updated.clone());
                pair.b().insert(callee.to_string(), updated.clone());
                Ok(updated)
            }
            None => {
                pair.a().remove(caller);
                pair.b().remove(callee);
                Ok(current)
            }
        }
    }

    /// Gate for media relay between `from` and `to`. Allowed while Accepted or
    /// Negotiating; the caller's first offer moves Accepted -> Negotiating.
    pub async fn admit_media(
        &self,
        from: &str,
        to: &str,
        kind: MediaKind,
    ) -> Result<CallState, SignalingError> {
        let mut pair = self.slots.lock_pair(from, to).await;

        let current = match pair.a().get(from) {
            Some(a) if a.involves(from, to) => a.clone(),
            _ => {
                return Err(SignalingError::WrongState {
                    a: from.to_string(),
                    b: to.to_string(),
                    actual: CallState::Idle,
                    expected: "Accepted or Negotiating",
                })
            }
        };

        match current.state {
            CallState::Accepted if kind == MediaKind::Offer && current.caller == from => {
                let mut updated = current;
                updated.state = CallState::Negotiating;
                pair.a().insert(from.to_string(), updated.clone());
                pair.b().insert(to.to_string(), updated);
                Ok(CallState::Negotiating)
            }
            CallState::Accepted | CallState::Negotiating => Ok(current.state),
            other => Err(SignalingError::WrongState {
                a: from.to_string(),
                b: to.to_string(),
                actual: other,
                expected: "Accepted or Negotiating",
            }),
        }
    }

    /// Accepted/Negotiating -> Idle. `Ok(None)` when the pair is already idle,
    /// so a double hang-up is harmless.
    pub async fn end(&self, from: &str, to: &str) -> Result<Option<CallAttempt>, SignalingError> {
        let mut pair = self.slots.lock_pair(from, to).await;

        let current = match pair.a().get(from) {
            Some(a) if a.involves(from, to) => a.clone(),
            _ => return Ok(None),
        };
        if !current.is_live() {
            return Err(SignalingError::WrongState {
                a: from.to_string(),
                b: to.to_string(),
                actual: current.state,
                expected: "Accepted or Negotiating",
            });
        }

        pair.a().remove(from);
        pair.b().remove(to);
        Ok(Some(current))
    }

    /// Holds the call shard of `user_id`, stalling every transition that
    /// touches it.
    #[cfg(test)]
    pub(crate) async fn hold(
        &self,
        user_id: &str,
    ) -> tokio::sync::MutexGuard<'_, std::collections::HashMap<String, CallAttempt>> {
        self.slots.lock(user_id).await
    }

    /// Ends the live (Accepted/Negotiating) attempt `user_id` takes part in.
    /// Ringing attempts are left for the ring timeout.
    pub async fn drop_user(&self, user_id: &str) -> Option<CallAttempt> {
        let attempt = self.attempt_of(user_id).await?;
        if !attempt.is_live() {
            return None;
        }
        let peer = attempt.peer_of(user_id).to_string();
        // Re-checked under the pair lock; the attempt may have moved on.
        self.end(user_id, &peer).await.ok().flatten()
    }
}

// ============================================
// Call operations
// ============================================

impl AppState {
    /// `call-request`: ring the callee, or tell the caller why not.
    pub async fn request_call(
        self: &Arc<Self>,
        caller: &str,
        callee: &str,
        metadata: CallerInfo,
    ) -> Result<CallState, SignalingError> {
        if !self.registry.is_online(callee).await {
            info!("Call from {} to {}: callee offline", caller, callee);
            self.registry
                .deliver(caller, ServerMessage::UserOffline { user_id: callee.to_string() })
                .await;
            return Ok(CallState::Idle);
        }

        let start = match self.calls.begin(caller, callee, metadata).await {
            Ok(start) => start,
            Err(SignalingError::Busy { user }) => {
                info!("Call from {} to {}: {} is busy", caller, callee, user);
                self.registry.deliver(caller, ServerMessage::UserBusy { user_id: user }).await;
                return Ok(CallState::Idle);
            }
            Err(e) => return Err(e),
        };
        let attempt = start.attempt().clone();
        let phase = match start {
            RingStart::Started(_) => "started",
            RingStart::Restarted(_) => "restarted",
        };
        info!("Call {} {}: {} -> {} ringing", attempt.id, phase, caller, callee);

        self.spawn_ring_timeout(&attempt);

        let (first_name, last_name, image) =
            self.resolve_caller(caller, &attempt.caller_info).await;

        // Directory lookup is a suspension point; the caller may have
        // cancelled meanwhile.
        if !self.calls.is_ringing(callee, attempt.id).await {
            debug!("Call {} no longer ringing, not delivering incoming-call", attempt.id);
            return Ok(CallState::Idle);
        }

        self.registry
            .deliver(
                callee,
                ServerMessage::IncomingCall {
                    from: caller.to_string(),
                    caller_first_name: first_name,
                    caller_last_name: last_name,
                    caller_image: image,
                    room_url: attempt.caller_info.room_url.clone(),
                },
            )
            .await;

        Ok(CallState::Ringing)
    }

    /// `accept-call`: the callee picks up.
    pub async fn accept_call(
        &self,
        callee: &str,
        caller: &str,
    ) -> Result<CallState, SignalingError> {
        let attempt = self.calls.accept(callee, caller).await?;
        info!("Call {} accepted by {}", attempt.id, callee);

        let delivered = self
            .registry
            .deliver(caller, ServerMessage::CallAccepted { from: callee.to_string() })
            .await;

        if !delivered && !self.registry.is_online(caller).await {
            // Caller left while ringing; nobody is left to negotiate with.
            warn!(
                "Caller {} gone when {} accepted call {}, ending it",
                caller, callee, attempt.id
            );
            if self.calls.end(callee, caller).await?.is_some() {
                self.registry
                    .deliver(callee, ServerMessage::CallEnded { from: caller.to_string() })
                    .await;
            }
            return Ok(CallState::Idle);
        }

        Ok(CallState::Accepted)
    }

    /// `reject-call`: the callee declines.
    pub async fn reject_call(&self, callee: &str, caller: &str) -> Result<(), SignalingError> {
        let attempt = self.calls.reject(callee, caller).await?;
        info!("Call {} rejected by {}", attempt.id, callee);
        self.registry
            .deliver(caller, ServerMessage::CallRejected { from: callee.to_string() })
            .await;
        Ok(())
    }

    /// `cancel-call`: the caller gives up before an answer. The callee gets a
    /// missed-call notification.
    pub async fn cancel_call(
        &self,
        caller: &str,
        callee: &str,
        caller_name: Option<String>,
        caller_image: Option<String>,
    ) -> Result<(), SignalingError> {
        let attempt = self.calls.cancel(caller, callee).await?;
        info!("Call {} cancelled by {}", attempt.id, caller);

        let (first, last, resolved_image) = self.resolve_caller(caller, &attempt.caller_info).await;
        let name = caller_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} {}", first, last).trim().to_string());

        self.notify_missed_call(
            callee,
            MissedCall {
                caller_id: caller.to_string(),
                caller_name: name,
                caller_image: caller_image.or(resolved_image),
            },
        )
        .await;
        Ok(())
    }

    /// `end-call`: either party hangs up. Repeating it is a no-op.
    pub async fn end_call(&self, from: &str, to: &str) -> Result<(), SignalingError> {
        match self.calls.end(from, to).await? {
            Some(attempt) => {
                info!(
                    "Call {} ended by {} after {:?}",
                    attempt.id,
                    from,
                    attempt.started_at.elapsed()
                );
                self.registry
                    .deliver(to, ServerMessage::CallEnded { from: from.to_string() })
                    .await;
            }
            None => debug!("end-call from {} to {}: already idle", from, to),
        }
        Ok(())
    }

    /// Transport loss for `user_id`: an active call is ended on their behalf.
    pub async fn end_calls_for(&self, user_id: &str) {
        if let Some(attempt) = self.calls.drop_user(user_id).await {
            let peer = attempt.peer_of(user_id);
            info!("Call {} ended: {} disconnected", attempt.id, user_id);
            self.registry
                .deliver(peer, ServerMessage::CallEnded { from: user_id.to_string() })
                .await;
        }
    }

    fn spawn_ring_timeout(self: &Arc<Self>, attempt: &CallAttempt) {
        let state = Arc::clone(self);
        let (caller, callee, id) = (attempt.caller.clone(), attempt.callee.clone(), attempt.id);
        let ring_timeout = self.config.ring_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            state.expire_call(&caller, &callee, id).await;
        });
    }

    async fn expire_call(&self, caller: &str, callee: &str, id: u64) {
        let Some(attempt) = self.calls.expire(caller, callee, id).await else {
            return;
        };
        info!("Call {} from {} to {} timed out", attempt.id, caller, callee);

        let (first, last, image) = self.resolve_caller(caller, &attempt.caller_info).await;
        self.notify_missed_call(
            callee,
            MissedCall {
                caller_id: caller.to_string(),
                caller_name: format!("{} {}", first, last).trim().to_string(),
                caller_image: image,
            },
        )
        .await;
        self.registry
            .deliver(caller, ServerMessage::CallTimeout { user_id: callee.to_string() })
            .await;
    }

    /// Directory identity for `caller`, field by field falling back to what
    /// the client sent. A failing directory degrades to the client's data.
    async fn resolve_caller(
        &self,
        caller: &str,
        fallback: &CallerInfo,
    ) -> (String, String, Option<String>) {
        let record = match self.directory.display_info(caller).await {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Directory lookup for caller {} failed, using client metadata: {}",
                    caller, e
                );
                None
            }
        };

        let Some(record) = record else {
            return (
                fallback.first_name.clone(),
                fallback.last_name.clone(),
                fallback.image.clone(),
            );
        };

        let pick = |stored: &str, sent: &str| {
            if stored.is_empty() {
                sent.to_string()
            } else {
                stored.to_string()
            }
        };
        (
            pick(&record.first_name, &fallback.first_name),
            pick(&record.last_name, &fallback.last_name),
            record
                .picture_url(&self.config.api_base_url)
                .or_else(|| fallback.image.clone()),
        )
    }
}
