//! Request and notification handling for a single room.
//!
//! Validation order for `join` is uid, membership, roomId presence, roomId
//! match. Every request gets exactly one reply through the caller's sink;
//! notifications never get one.

use std::sync::Arc;

use huddle_core::protocol::{require_str, require_uid};
use huddle_core::{Field, Notification, Reply, ReplySink, Request, Response, RoomId, SignalError, UserId};
use serde_json::{json, Value};

use crate::registry::RoomRegistry;
use crate::room::{Fanout, Room, PEER_JOINED, PEER_LEFT};
use crate::user::User;

pub const JOIN: &str = "join";
pub const PUBLISH: &str = "publish";
pub const CLOSE: &str = "close";

/// Result of handing a request to a room.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The reply that was sent to the requester.
    Replied(Reply),
    /// The room was removed before the join could land. Nothing was sent;
    /// the caller re-resolves the room through the registry.
    Retired,
}

/// Result of handing a notification to a room.
#[derive(Debug, PartialEq)]
pub enum NotificationOutcome {
    /// A `close` removed `uid`; `remaining` members are left.
    Left { uid: UserId, remaining: usize },
    /// Logged and dropped.
    Ignored(SignalError),
}

/// A request handled outside of any bound room.
#[derive(Debug)]
pub struct Routed {
    pub reply: Reply,
    /// Room the requester now belongs to, set when a join succeeded.
    pub room: Option<Arc<Room>>,
    /// Whether the registry created the room for this request.
    pub created: bool,
}

enum Handled {
    Accept(Value, Option<Fanout>),
    Retired,
}

impl Room {
    /// Handle one request from `sink`'s session.
    pub fn on_request(&self, req: &Request, sink: &Arc<dyn ReplySink>) -> RequestOutcome {
        let result = match req.method.as_str() {
            JOIN => self.join(&req.payload, sink),
            PUBLISH => self.publish(&req.payload),
            other => Err(SignalError::UnknownMethod(other.to_string())),
        };

        let (reply, fanout) = match result {
            Ok(Handled::Accept(data, fanout)) => (Reply::accept(&req.id, data), fanout),
            Ok(Handled::Retired) => return RequestOutcome::Retired,
            Err(err) => {
                tracing::warn!(
                    room_id = %self.id(),
                    session_key = %sink.session_key(),
                    method = %req.method,
                    error_kind = err.error_kind(),
                    "request rejected: {err}"
                );
                (Reply::from_error(&req.id, &err), None)
            }
        };

        send_reply(sink, &reply);
        if let Some(fanout) = fanout {
            fanout.deliver();
        }
        RequestOutcome::Replied(reply)
    }

    /// Handle one notification. Failures are logged, never fatal.
    pub fn on_notification(&self, notification: &Notification) -> NotificationOutcome {
        match notification.method.as_str() {
            CLOSE => match self.close(&notification.payload) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(
                        room_id = %self.id(),
                        error_kind = err.error_kind(),
                        "close ignored: {err}"
                    );
                    NotificationOutcome::Ignored(err)
                }
            },
            other => {
                tracing::debug!(room_id = %self.id(), method = other, "unhandled notification");
                NotificationOutcome::Ignored(SignalError::UnknownMethod(other.to_string()))
            }
        }
    }

    /// Answer to a request this room issued. Rooms issue none today, so this
    /// only records the event.
    pub fn on_response(&self, response: &Response) {
        tracing::debug!(
            room_id = %self.id(),
            response_id = %response.id,
            ok = response.is_ok(),
            "response received"
        );
    }

    fn join(&self, payload: &Value, sink: &Arc<dyn ReplySink>) -> Result<Handled, SignalError> {
        let uid = require_uid(payload)?;

        let mut state = self.lock();
        if state.retired {
            return Ok(Handled::Retired);
        }
        if state.users.contains_key(uid) {
            return Err(SignalError::UserExists(uid.to_string()));
        }
        let room_id = require_str(payload, Field::RoomId)?;
        if room_id != self.id().as_str() {
            return Err(SignalError::RoomMismatch {
                expected: self.id().to_string(),
                actual: room_id.to_string(),
            });
        }

        let uid = UserId::from(uid);
        state.users.insert(
            uid.clone(),
            User::new(uid.clone(), self.id().clone(), Arc::clone(sink)),
        );
        let data = Room::membership_view(&state);
        let fanout = self.peer_fanout(&state, PEER_JOINED, &uid);
        let members = state.users.len();
        drop(state);

        tracing::info!(
            room_id = %self.id(),
            uid = %uid,
            session_key = %sink.session_key(),
            members,
            "user joined"
        );
        Ok(Handled::Accept(data, Some(fanout)))
    }

    fn publish(&self, payload: &Value) -> Result<Handled, SignalError> {
        let uid = require_uid(payload)?;
        if !self.contains(uid) {
            return Err(SignalError::UidNotFound(uid.to_string()));
        }
        let sdp = require_str(payload, Field::Sdp)?;
        tracing::debug!(room_id = %self.id(), uid, sdp_len = sdp.len(), "sdp published");
        Ok(Handled::Accept(json!({ "sdp": sdp }), None))
    }

    fn close(&self, payload: &Value) -> Result<NotificationOutcome, SignalError> {
        let room_id = require_str(payload, Field::RoomId)?;
        if room_id != self.id().as_str() {
            return Err(SignalError::RoomMismatch {
                expected: self.id().to_string(),
                actual: room_id.to_string(),
            });
        }
        let uid = require_uid(payload)?;

        let (user, remaining, fanout) = {
            let mut state = self.lock();
            let Some(user) = state.users.shift_remove(uid) else {
                return Err(SignalError::UidNotFound(uid.to_string()));
            };
            let fanout = self.peer_fanout(&state, PEER_LEFT, user.uid());
            (user, state.users.len(), fanout)
        };
        fanout.deliver();

        tracing::info!(
            room_id = %self.id(),
            uid = %user.uid(),
            session_key = %user.session_key(),
            remaining,
            "user left"
        );
        Ok(NotificationOutcome::Left {
            uid: user.uid().clone(),
            remaining,
        })
    }
}

fn send_reply(sink: &Arc<dyn ReplySink>, reply: &Reply) {
    if !sink.send_reply(reply.clone()) {
        tracing::debug!(
            session_key = %sink.session_key(),
            reply_id = reply.id(),
            "reply not delivered"
        );
    }
}

fn reject(sink: &Arc<dyn ReplySink>, req: &Request, err: &SignalError) -> Routed {
    tracing::warn!(
        session_key = %sink.session_key(),
        method = %req.method,
        error_kind = err.error_kind(),
        "request rejected: {err}"
    );
    let reply = Reply::from_error(&req.id, err);
    send_reply(sink, &reply);
    Routed {
        reply,
        room: None,
        created: false,
    }
}

/// Join on behalf of a session that is not in any room yet. The target room
/// comes from the payload's `roomId`, checked after the uid so rejection
/// order matches an in-room join.
pub fn route_join(registry: &RoomRegistry, req: &Request, sink: &Arc<dyn ReplySink>) -> Routed {
    let target = require_uid(&req.payload).and_then(|_| require_str(&req.payload, Field::RoomId));
    let room_id = match target {
        Ok(id) => RoomId::from(id),
        Err(err) => return reject(sink, req, &err),
    };

    let mut created = false;
    loop {
        let (room, fresh) = registry.get_or_create_flagged(&room_id);
        created |= fresh;
        match room.on_request(req, sink) {
            RequestOutcome::Replied(reply) => {
                let room = reply.is_accept().then_some(room);
                return Routed {
                    reply,
                    room,
                    created,
                };
            }
            RequestOutcome::Retired => {
                tracing::debug!(room_id = %room_id, "room retired during join, retrying");
            }
        }
    }
}

/// Handle a request from a session that has not joined a room.
pub fn dispatch_unbound(registry: &RoomRegistry, req: &Request, sink: &Arc<dyn ReplySink>) -> Routed {
    match req.method.as_str() {
        JOIN => route_join(registry, req, sink),
        PUBLISH => {
            let err = match require_uid(&req.payload) {
                Ok(uid) => SignalError::UidNotFound(uid.to_string()),
                Err(err) => err,
            };
            reject(sink, req, &err)
        }
        other => reject(sink, req, &SignalError::UnknownMethod(other.to_string())),
    }
}
