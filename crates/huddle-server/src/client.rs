//! Transport sessions: the connection manager's registry and the per-session
//! outbound queue that rooms reply through.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_core::{Notification, Reply, ReplySink, SessionKey};
use huddle_room::Room;
use huddle_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// One connected WebSocket peer.
pub struct ClientSession {
    key: SessionKey,
    tx: mpsc::Sender<String>,
    pub connected_at: Instant,
    /// Room this session joined. Requests are routed here once set.
    room: Mutex<Option<Arc<Room>>>,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ClientSession {
    pub fn new(
        key: SessionKey,
        tx: mpsc::Sender<String>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            tx,
            connected_at: now,
            room: Mutex::new(None),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn bind_room(&self, room: Arc<Room>) {
        *self.room.lock() = Some(room);
    }

    pub fn bound_room(&self) -> Option<Arc<Room>> {
        self.room.lock().clone()
    }

    pub fn take_room(&self) -> Option<Arc<Room>> {
        self.room.lock().take()
    }

    /// Queue a text frame. Never blocks: a full or closed queue drops the
    /// frame and bumps the drop counter.
    pub fn send_text(&self, text: String) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(err) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.counter_inc("messages_dropped_total", &[], 1);
                }
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                tracing::warn!(session_key = %self.key, reason, "dropping outbound message");
                false
            }
        }
    }

    fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!(session_key = %self.key, error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (pong or frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag. `true` if there was activity since the
    /// previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl ReplySink for ClientSession {
    fn session_key(&self) -> &SessionKey {
        &self.key
    }

    fn send_reply(&self, reply: Reply) -> bool {
        self.send_json(&reply)
    }

    fn send_notification(&self, notification: Notification) -> bool {
        self.send_json(&notification)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("key", &self.key)
            .field("room", &self.bound_room().map(|r| r.id().clone()))
            .field("dropped_messages", &self.drop_count())
            .finish()
    }
}

/// Lifecycle callbacks for transport sessions. All hooks default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// A session was accepted and registered.
    fn on_open(&self, _session: &ClientSession) {}

    /// The transport reported an error. The session is torn down afterwards.
    fn on_failed(&self, _session: &ClientSession, _reason: &str) {}

    /// The transport is gone; the session is still registered.
    fn on_disconnected(&self, _session: &ClientSession) {}

    /// The session was removed from the registry.
    fn on_close(&self, _key: &SessionKey) {}
}

/// Observer that does nothing.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Live sessions keyed by [`SessionKey`].
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<ClientSession>>,
    max_send_queue: usize,
    observer: Arc<dyn SessionObserver>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionRegistry {
    pub fn new(
        max_send_queue: usize,
        observer: Arc<dyn SessionObserver>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            observer,
            metrics,
        }
    }

    pub fn observer(&self) -> &Arc<dyn SessionObserver> {
        &self.observer
    }

    /// Register a new session for `peer`. The key is the peer endpoint; a
    /// generated key is used when the endpoint is unknown or already taken.
    pub fn on_accept(&self, peer: Option<SocketAddr>) -> (Arc<ClientSession>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let mut key = peer
            .map(|addr| SessionKey::from_endpoint(&addr))
            .unwrap_or_default();

        let session = loop {
            match self.sessions.entry(key) {
                Entry::Vacant(slot) => {
                    let session = Arc::new(ClientSession::new(
                        slot.key().clone(),
                        tx,
                        self.metrics.clone(),
                    ));
                    let _ = slot.insert(Arc::clone(&session));
                    break session;
                }
                Entry::Occupied(slot) => {
                    tracing::warn!(session_key = %slot.key(), "session key in use, generating one");
                    key = SessionKey::new();
                }
            }
        };

        tracing::info!(session_key = %session.key(), sessions = self.len(), "session accepted");
        self.observer.on_open(&session);
        (session, rx)
    }

    /// Drop the session. Idempotent: an unknown key is logged and ignored.
    pub fn on_session_close(&self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some(_) => {
                tracing::info!(session_key = %key, sessions = self.len(), "session closed");
                self.observer.on_close(key);
                true
            }
            None => {
                tracing::warn!(session_key = %key, "close for unknown session");
                false
            }
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<ClientSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::ErrorCode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn make_session(cap: usize) -> (ClientSession, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(cap);
        (ClientSession::new(SessionKey::from("s1"), tx, None), rx)
    }

    #[derive(Default)]
    struct CountingObserver {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl SessionObserver for CountingObserver {
        fn on_open(&self, _session: &ClientSession) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _key: &SessionKey) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn reply_is_serialized_to_queue() {
        let (session, mut rx) = make_session(8);
        assert!(session.accept("1", json!({"users": []})));
        assert!(session.reject("2", ErrorCode::Uid, "uid a doesn't exist"));

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first, json!({"id": "1", "data": {"users": []}}));
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["errorCode"], 2);
    }

    #[tokio::test]
    async fn notification_is_serialized_to_queue() {
        let (session, mut rx) = make_session(8);
        assert!(session.send_notification(Notification::new("peerLeft", json!({"uid": "a", "roomId": "r1"}))));
        let value: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value, json!({"method": "peerLeft", "payload": {"uid": "a", "roomId": "r1"}}));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let metrics = Arc::new(MetricsRecorder::new());
        let (tx, _rx) = mpsc::channel(1);
        let session = ClientSession::new(SessionKey::from("s1"), tx, Some(Arc::clone(&metrics)));
        assert!(session.send_text("one".into()));
        assert!(!session.send_text("two".into()));
        assert_eq!(session.drop_count(), 1);
        assert_eq!(metrics.counter_get("messages_dropped_total", &[]), 1);
    }

    #[test]
    fn closed_queue_drops() {
        let (session, rx) = make_session(4);
        drop(rx);
        assert!(!session.send_text("x".into()));
        assert_eq!(session.drop_count(), 1);
    }

    #[test]
    fn liveness_tracking() {
        let (session, _rx) = make_session(1);
        assert!(session.check_alive());
        assert!(!session.check_alive());
        session.mark_alive();
        assert!(session.check_alive());
        assert!(session.last_seen_elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn room_binding() {
        let (session, _rx) = make_session(1);
        assert!(session.bound_room().is_none());
        session.bind_room(Arc::new(Room::new("r1".into())));
        assert_eq!(session.bound_room().unwrap().id().as_str(), "r1");
        assert!(session.take_room().is_some());
        assert!(session.bound_room().is_none());
    }

    #[test]
    fn accept_keys_by_endpoint() {
        let registry = SessionRegistry::new(8, Arc::new(NoopObserver), None);
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let (session, _rx) = registry.on_accept(Some(peer));
        assert_eq!(session.key().as_str(), "10.1.2.3:5555");
        assert_eq!(registry.len(), 1);
        assert!(registry.get(session.key()).is_some());
    }

    #[test]
    fn duplicate_endpoint_gets_generated_key() {
        let registry = SessionRegistry::new(8, Arc::new(NoopObserver), None);
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let (first, _rx1) = registry.on_accept(Some(peer));
        let (second, _rx2) = registry.on_accept(Some(peer));
        assert_ne!(first.key(), second.key());
        assert!(second.key().as_str().starts_with("sess_"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_peer_gets_generated_key() {
        let registry = SessionRegistry::new(8, Arc::new(NoopObserver), None);
        let (session, _rx) = registry.on_accept(None);
        assert!(session.key().as_str().starts_with("sess_"));
    }

    #[test]
    fn close_is_idempotent() {
        let observer = Arc::new(CountingObserver::default());
        let registry = SessionRegistry::new(8, observer.clone(), None);
        let (session, _rx) = registry.on_accept(None);
        let key = session.key().clone();

        assert!(registry.on_session_close(&key));
        assert!(!registry.on_session_close(&key));
        assert!(registry.is_empty());
        assert_eq!(observer.opened.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
    }
}
