//! Outbound capability handed to rooms.
//!
//! A room never sees the transport. It replies and notifies through a
//! [`ReplySink`], implemented by the server's client session and by
//! [`RecordingSink`] in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::ErrorCode;
use crate::ids::SessionKey;
use crate::protocol::{Notification, Reply};

/// Outbound half of one transport session.
///
/// Sends never block. Returns `false` when the message could not be queued
/// (peer gone or queue full).
pub trait ReplySink: Send + Sync {
    /// Key of the session this sink writes to.
    fn session_key(&self) -> &SessionKey;

    fn send_reply(&self, reply: Reply) -> bool;

    fn send_notification(&self, notification: Notification) -> bool;

    fn accept(&self, id: &str, data: Value) -> bool {
        self.send_reply(Reply::accept(id, data))
    }

    fn reject(&self, id: &str, code: ErrorCode, message: &str) -> bool {
        self.send_reply(Reply::reject(id, code, message))
    }
}

/// Everything a [`RecordingSink`] was asked to send, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Reply(Reply),
    Notification(Notification),
}

/// In-memory [`ReplySink`] that records outbound traffic.
#[derive(Debug)]
pub struct RecordingSink {
    key: SessionKey,
    sent: Mutex<Vec<Recorded>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new(key: impl Into<SessionKey>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Make subsequent sends fail, as if the peer disconnected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<Recorded> {
        self.sent.lock().clone()
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Reply(reply) => Some(reply.clone()),
                Recorded::Notification(_) => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Notification(n) => Some(n.clone()),
                Recorded::Reply(_) => None,
            })
            .collect()
    }

    pub fn last_reply(&self) -> Option<Reply> {
        self.replies().pop()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    fn push(&self, item: Recorded) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.sent.lock().push(item);
        true
    }
}

impl ReplySink for RecordingSink {
    fn session_key(&self) -> &SessionKey {
        &self.key
    }

    fn send_reply(&self, reply: Reply) -> bool {
        self.push(Recorded::Reply(reply))
    }

    fn send_notification(&self, notification: Notification) -> bool {
        self.push(Recorded::Notification(notification))
    }
}
