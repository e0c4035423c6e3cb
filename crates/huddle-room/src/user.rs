use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_core::{ReplySink, RoomId, SessionKey, UserId};

/// One joined participant.
#[derive(Clone)]
pub struct User {
    uid: UserId,
    room_id: RoomId,
    joined_at: DateTime<Utc>,
    reply: Arc<dyn ReplySink>,
}

impl User {
    pub fn new(uid: UserId, room_id: RoomId, reply: Arc<dyn ReplySink>) -> Self {
        Self {
            uid,
            room_id,
            joined_at: Utc::now(),
            reply,
        }
    }

    pub fn uid(&self) -> &UserId {
        &self.uid
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Session that owns this user.
    pub fn session_key(&self) -> &SessionKey {
        self.reply.session_key()
    }

    pub fn reply_sink(&self) -> &Arc<dyn ReplySink> {
        &self.reply
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("uid", &self.uid)
            .field("room_id", &self.room_id)
            .field("session", self.session_key())
            .field("joined_at", &self.joined_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::RecordingSink;

    #[test]
    fn user_is_bound_to_its_session() {
        let sink = RecordingSink::new("127.0.0.1:4000");
        let user = User::new(UserId::from("alice"), RoomId::from("r1"), sink);
        assert_eq!(user.uid().as_str(), "alice");
        assert_eq!(user.room_id().as_str(), "r1");
        assert_eq!(user.session_key().as_str(), "127.0.0.1:4000");
        assert!(user.joined_at() <= Utc::now());
    }

    #[test]
    fn debug_omits_sink_internals() {
        let user = User::new(UserId::from("bob"), RoomId::from("r1"), RecordingSink::new("s"));
        let dbg = format!("{user:?}");
        assert!(dbg.contains("bob"));
        assert!(dbg.contains("session"));
    }
}
