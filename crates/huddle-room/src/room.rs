//! Room state: the ordered participant map guarded by a per-room lock.
//!
//! Every mutation happens under the room's own mutex; replies and peer
//! notifications are built under the lock and sent after it is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_core::{Notification, ReplySink, RoomId, SessionKey, UserId};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value};

use crate::user::User;

/// Sent to the other members when someone joins.
pub const PEER_JOINED: &str = "peerJoined";
/// Sent to the remaining members when someone leaves.
pub const PEER_LEFT: &str = "peerLeft";

pub(crate) struct RoomState {
    /// Insertion-ordered so membership snapshots are repeatable.
    pub(crate) users: IndexMap<UserId, User>,
    /// Set once the room is removed from the registry. A retired room never
    /// accepts members again.
    pub(crate) retired: bool,
}

/// A named group of participants.
pub struct Room {
    id: RoomId,
    created_at: DateTime<Utc>,
    state: Mutex<RoomState>,
}

/// Pending peer notifications, sent once the room lock is released.
pub(crate) struct Fanout {
    targets: Vec<Arc<dyn ReplySink>>,
    notification: Notification,
}

impl Fanout {
    pub(crate) fn deliver(self) {
        for target in &self.targets {
            if !target.send_notification(self.notification.clone()) {
                tracing::debug!(
                    session_key = %target.session_key(),
                    method = %self.notification.method,
                    "peer notification not delivered"
                );
            }
        }
    }
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(RoomState {
                users: IndexMap::new(),
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.state.lock().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().users.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.state.lock().users.contains_key(uid)
    }

    /// Member ids in join order.
    pub fn user_ids(&self) -> Vec<UserId> {
        self.state.lock().users.keys().cloned().collect()
    }

    /// Whether any member is bound to the given session.
    pub fn has_session(&self, key: &SessionKey) -> bool {
        self.state
            .lock()
            .users
            .values()
            .any(|u| u.session_key() == key)
    }

    /// Remove every member owned by `key`, e.g. after its transport closed.
    /// Remaining members are told about each departure.
    pub fn evict_session(&self, key: &SessionKey) -> Vec<UserId> {
        let (evicted, fanouts) = {
            let mut state = self.state.lock();
            let evicted: Vec<UserId> = state
                .users
                .values()
                .filter(|u| u.session_key() == key)
                .map(|u| u.uid().clone())
                .collect();
            let mut fanouts = Vec::with_capacity(evicted.len());
            for uid in &evicted {
                state.users.shift_remove(uid);
                fanouts.push(self.peer_fanout(&state, PEER_LEFT, uid));
            }
            (evicted, fanouts)
        };

        for fanout in fanouts {
            fanout.deliver();
        }
        if !evicted.is_empty() {
            tracing::info!(
                room_id = %self.id,
                session_key = %key,
                evicted = evicted.len(),
                "session users evicted"
            );
        }
        evicted
    }

    /// Mark the room retired if it has no members. Called by the registry
    /// while it holds the map entry, so the check and the removal are atomic
    /// with respect to joins.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.users.is_empty() {
            state.retired = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock()
    }

    /// `{ users: [ { uid }, ... ] }` in join order.
    pub(crate) fn membership_view(state: &RoomState) -> Value {
        let users: Vec<Value> = state
            .users
            .keys()
            .map(|uid| json!({ "uid": uid }))
            .collect();
        json!({ "users": users })
    }

    /// Notification for every member except `uid`.
    pub(crate) fn peer_fanout(&self, state: &RoomState, method: &str, uid: &UserId) -> Fanout {
        let targets = state
            .users
            .values()
            .filter(|u| u.uid() != uid)
            .map(|u| Arc::clone(u.reply_sink()))
            .collect();
        Fanout {
            targets,
            notification: Notification::new(
                method,
                json!({ "uid": uid, "roomId": self.id }),
            ),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("users", &state.users.keys().collect::<Vec<_>>())
            .field("retired", &state.retired)
            .finish()
    }
}
