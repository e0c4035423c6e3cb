//! Per-session message handling: decode a frame, route it to the session's
//! room, record the outcome.

use std::sync::Arc;
use std::time::Instant;

use huddle_core::{parse_inbound, ErrorCode, InboundMessage, Notification, Reply, ReplySink, Request};
use huddle_room::{dispatch_unbound, route_join, NotificationOutcome, RequestOutcome, Room, RoomRegistry, Routed};
use huddle_telemetry::MetricsRecorder;

use crate::client::ClientSession;

/// Processes the inbound frames of one session, in arrival order.
pub struct ConnectionHandler {
    session: Arc<ClientSession>,
    rooms: Arc<RoomRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ConnectionHandler {
    pub fn new(
        session: Arc<ClientSession>,
        rooms: Arc<RoomRegistry>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            session,
            rooms,
            metrics,
        }
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Handle one text frame. Returns the reply when the frame was a request.
    pub fn handle_text(&self, text: &str) -> Option<Reply> {
        match parse_inbound(text) {
            Ok(InboundMessage::Request(req)) => Some(self.handle_request(&req)),
            Ok(InboundMessage::Notification(notification)) => {
                self.handle_notification(&notification);
                None
            }
            Ok(InboundMessage::Response(response)) => {
                match self.session.bound_room() {
                    Some(room) => room.on_response(&response),
                    None => tracing::debug!(
                        session_key = %self.session.key(),
                        response_id = %response.id,
                        "response on unbound session ignored"
                    ),
                }
                None
            }
            Err(err) => {
                tracing::warn!(session_key = %self.session.key(), error = %err, "malformed frame");
                let id = err.request_id()?;
                let reply = Reply::reject(id, ErrorCode::Method, err.to_string());
                let _ = self.session.send_reply(reply.clone());
                self.count_rejection(ErrorCode::Method);
                Some(reply)
            }
        }
    }

    fn handle_request(&self, req: &Request) -> Reply {
        let start = Instant::now();
        let sink: Arc<dyn ReplySink> = self.session.clone();

        let reply = match self.owned_room() {
            Some(room) => match room.on_request(req, &sink) {
                RequestOutcome::Replied(reply) => reply,
                RequestOutcome::Retired => {
                    let _ = self.session.take_room();
                    self.bind(route_join(&self.rooms, req, &sink))
                }
            },
            None => self.bind(dispatch_unbound(&self.rooms, req, &sink)),
        };

        if let Some(m) = &self.metrics {
            m.counter_inc("requests_total", &[("method", req.method.as_str())], 1);
            m.histogram_observe(
                "request_duration_ms",
                &[("method", req.method.as_str())],
                start.elapsed().as_secs_f64() * 1000.0,
            );
        }
        if let Some(code) = reply.error_code() {
            self.count_rejection(code);
        }
        reply
    }

    /// The bound room, provided this session still owns a user there. Other
    /// peers may have closed all of its users; such a binding is dropped.
    fn owned_room(&self) -> Option<Arc<Room>> {
        let room = self.session.bound_room()?;
        if room.has_session(self.session.key()) {
            return Some(room);
        }
        tracing::debug!(
            session_key = %self.session.key(),
            room_id = %room.id(),
            "session owns no users in bound room, unbinding"
        );
        let _ = self.session.take_room();
        None
    }

    fn bind(&self, routed: Routed) -> Reply {
        if routed.created {
            if let Some(m) = &self.metrics {
                m.counter_inc("rooms_created_total", &[], 1);
            }
        }
        if let Some(room) = routed.room {
            tracing::debug!(session_key = %self.session.key(), room_id = %room.id(), "session bound to room");
            self.session.bind_room(room);
        }
        routed.reply
    }

    fn handle_notification(&self, notification: &Notification) {
        if let Some(m) = &self.metrics {
            m.counter_inc("notifications_total", &[("method", notification.method.as_str())], 1);
        }

        let Some(room) = self.session.bound_room() else {
            tracing::debug!(
                session_key = %self.session.key(),
                method = %notification.method,
                "notification on unbound session ignored"
            );
            self.count_ignored("unbound");
            return;
        };

        match room.on_notification(notification) {
            NotificationOutcome::Left { remaining, .. } => {
                if !room.has_session(self.session.key()) {
                    let _ = self.session.take_room();
                }
                if remaining == 0 {
                    self.cleanup(&room);
                }
            }
            NotificationOutcome::Ignored(err) => self.count_ignored(err.error_kind()),
        }
    }

    /// Evict everything this session still owns. Runs once the transport is
    /// gone.
    pub fn disconnect(&self) {
        reconcile_session(&self.session, &self.rooms, self.metrics.as_deref());
    }

    fn cleanup(&self, room: &Room) {
        cleanup_room(&self.rooms, room, self.metrics.as_deref());
    }

    fn count_rejection(&self, code: ErrorCode) {
        if let Some(m) = &self.metrics {
            m.counter_inc("requests_rejected_total", &[("code", code.name())], 1);
        }
    }

    fn count_ignored(&self, reason: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("notifications_ignored_total", &[("reason", reason)], 1);
        }
    }
}

/// Remove the session's users from its room and apply the cleanup policy.
/// Safe to call more than once.
pub fn reconcile_session(session: &ClientSession, rooms: &RoomRegistry, metrics: Option<&MetricsRecorder>) {
    let Some(room) = session.take_room() else {
        return;
    };
    let evicted = room.evict_session(session.key());
    tracing::debug!(
        session_key = %session.key(),
        room_id = %room.id(),
        evicted = evicted.len(),
        "session reconciled"
    );
    if room.is_empty() {
        cleanup_room(rooms, &room, metrics);
    }
}

fn cleanup_room(rooms: &RoomRegistry, room: &Room, metrics: Option<&MetricsRecorder>) {
    if rooms.cleanup(room.id()) {
        if let Some(m) = metrics {
            m.counter_inc("rooms_removed_total", &[], 1);
        }
    }
}
