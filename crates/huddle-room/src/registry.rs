use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use huddle_core::{RoomId, SignalError};
use serde::{Deserialize, Serialize};

use crate::room::Room;

/// What happens to a room once its last member leaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomCleanupPolicy {
    /// Remove the room as soon as it is empty.
    #[default]
    RemoveWhenEmpty,
    /// Keep empty rooms until the reaper or an explicit `remove`.
    Retain,
}

/// Lifetime counters for the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub rooms: usize,
    pub created: u64,
    pub removed: u64,
}

/// All live rooms, keyed by id.
///
/// Creation goes through the map's entry API and removal through
/// `remove_if`, which checks emptiness under the room lock while the shard is
/// held. Lock order is always shard then room.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    policy: RoomCleanupPolicy,
    created: AtomicU64,
    removed: AtomicU64,
}

impl RoomRegistry {
    pub fn new(policy: RoomCleanupPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RoomCleanupPolicy {
        self.policy
    }

    /// Existing room or a freshly inserted empty one. Concurrent callers for
    /// the same id get the same instance.
    pub fn get_or_create(&self, id: &RoomId) -> Arc<Room> {
        self.get_or_create_flagged(id).0
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether
    /// this call created the room.
    pub fn get_or_create_flagged(&self, id: &RoomId) -> (Arc<Room>, bool) {
        if let Some(room) = self.rooms.get(id) {
            return (Arc::clone(room.value()), false);
        }

        let mut created = false;
        let room = Arc::clone(
            self.rooms
                .entry(id.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Room::new(id.clone()))
                })
                .value(),
        );
        if created {
            self.created.fetch_add(1, Ordering::Relaxed);
            tracing::info!(room_id = %id, "room created");
        }
        (room, created)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rooms.contains_key(id)
    }

    /// Remove an empty room. `Ok(false)` if there is no such room,
    /// `Err(RoomNotEmpty)` if it still has members.
    pub fn remove(&self, id: &RoomId) -> Result<bool, SignalError> {
        let mut occupied = false;
        let removed = self.rooms.remove_if(id, |_, room| {
            let retired = room.retire_if_empty();
            occupied = !retired;
            retired
        });

        match removed {
            Some((_, room)) => {
                self.removed.fetch_add(1, Ordering::Relaxed);
                let lifetime_secs = (Utc::now() - room.created_at()).num_seconds();
                tracing::info!(room_id = %id, lifetime_secs, "room removed");
                Ok(true)
            }
            None if occupied => Err(SignalError::RoomNotEmpty(id.to_string())),
            None => Ok(false),
        }
    }

    /// Remove the room only if it is empty right now.
    pub fn remove_if_empty(&self, id: &RoomId) -> bool {
        matches!(self.remove(id), Ok(true))
    }

    /// Apply the cleanup policy after a member left `id`. Returns whether the
    /// room was removed.
    pub fn cleanup(&self, id: &RoomId) -> bool {
        match self.policy {
            RoomCleanupPolicy::RemoveWhenEmpty => self.remove_if_empty(id),
            RoomCleanupPolicy::Retain => false,
        }
    }

    /// Remove every empty room. Returns how many were removed.
    pub fn reap_empty(&self) -> usize {
        // Collect first: removing while iterating would deadlock on the shard.
        let candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let reaped = candidates
            .iter()
            .filter(|id| self.remove_if_empty(id))
            .count();
        if reaped > 0 {
            tracing::debug!(reaped, remaining = self.len(), "empty rooms reaped");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Live room ids, sorted.
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.len(),
            created: self.created.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{route_join, JOIN};
    use huddle_core::{Notification, RecordingSink, ReplySink, Request};
    use serde_json::json;

    fn join_request(uid: &str, room: &str) -> Request {
        Request {
            id: format!("join-{uid}"),
            method: JOIN.to_string(),
            payload: json!({"uid": uid, "roomId": room}),
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = RoomRegistry::default();
        let id = RoomId::from("r1");
        let (a, created_a) = registry.get_or_create_flagged(&id);
        let (b, created_b) = registry.get_or_create_flagged(&id);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().created, 1);
    }

    #[test]
    fn get_does_not_create() {
        let registry = RoomRegistry::default();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_absent_is_noop() {
        let registry = RoomRegistry::default();
        assert_eq!(registry.remove(&RoomId::from("r1")), Ok(false));
    }

    #[test]
    fn remove_non_empty_is_refused() {
        let registry = RoomRegistry::default();
        let sink: Arc<dyn ReplySink> = RecordingSink::new("s1");
        route_join(&registry, &join_request("a", "r1"), &sink);

        assert_eq!(
            registry.remove(&RoomId::from("r1")),
            Err(SignalError::RoomNotEmpty("r1".into()))
        );
        assert!(!registry.remove_if_empty(&RoomId::from("r1")));
        let room = registry.get("r1").unwrap();
        assert!(!room.is_retired());
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn remove_retires_room() {
        let registry = RoomRegistry::default();
        let room = registry.get_or_create(&RoomId::from("r1"));
        assert_eq!(registry.remove(&RoomId::from("r1")), Ok(true));
        assert!(room.is_retired());
        assert!(!registry.contains("r1"));
        assert_eq!(registry.stats().removed, 1);

        let again = registry.get_or_create(&RoomId::from("r1"));
        assert!(!Arc::ptr_eq(&room, &again));
        assert!(!again.is_retired());
    }

    #[test]
    fn cleanup_follows_policy() {
        let remove = RoomRegistry::new(RoomCleanupPolicy::RemoveWhenEmpty);
        remove.get_or_create(&RoomId::from("r1"));
        assert!(remove.cleanup(&RoomId::from("r1")));
        assert!(remove.is_empty());

        let retain = RoomRegistry::new(RoomCleanupPolicy::Retain);
        retain.get_or_create(&RoomId::from("r1"));
        assert!(!retain.cleanup(&RoomId::from("r1")));
        assert_eq!(retain.len(), 1);
    }

    #[test]
    fn reap_removes_only_empty_rooms() {
        let registry = RoomRegistry::new(RoomCleanupPolicy::Retain);
        let sink: Arc<dyn ReplySink> = RecordingSink::new("s1");
        registry.get_or_create(&RoomId::from("empty-1"));
        registry.get_or_create(&RoomId::from("empty-2"));
        route_join(&registry, &join_request("a", "busy"), &sink);

        assert_eq!(registry.reap_empty(), 2);
        assert_eq!(registry.room_ids(), vec![RoomId::from("busy")]);
        assert_eq!(registry.reap_empty(), 0);
    }

    #[test]
    fn scenario_join_close_rejoin() {
        let registry = RoomRegistry::default();
        let sink: Arc<dyn ReplySink> = RecordingSink::new("s1");
        let names = |reply: &huddle_core::Reply| -> Vec<String> {
            reply.data().unwrap()["users"]
                .as_array()
                .unwrap()
                .iter()
                .map(|u| u["uid"].as_str().unwrap().to_string())
                .collect()
        };

        let first = route_join(&registry, &join_request("a", "r1"), &sink);
        assert_eq!(names(&first.reply), vec!["a"]);
        let room = first.room.unwrap();

        let second = route_join(&registry, &join_request("b", "r1"), &sink);
        assert_eq!(names(&second.reply), vec!["a", "b"]);

        room.on_notification(&Notification::new("close", json!({"uid": "a", "roomId": "r1"})));
        let third = route_join(&registry, &join_request("a", "r1"), &sink);
        assert_eq!(names(&third.reply), vec!["b", "a"]);
    }

    #[test]
    fn policy_serde() {
        assert_eq!(
            serde_json::to_string(&RoomCleanupPolicy::RemoveWhenEmpty).unwrap(),
            "\"remove_when_empty\""
        );
        let p: RoomCleanupPolicy = serde_json::from_str("\"retain\"").unwrap();
        assert_eq!(p, RoomCleanupPolicy::Retain);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_room() {
        let registry = Arc::new(RoomRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&RoomId::from("shared"))
            }));
        }
        let mut rooms = Vec::new();
        for h in handles {
            rooms.push(h.await.unwrap());
        }
        assert!(rooms.iter().all(|r| Arc::ptr_eq(r, &rooms[0])));
        assert_eq!(registry.stats().created, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_all_land() {
        let registry = Arc::new(RoomRegistry::default());
        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let sink: Arc<dyn ReplySink> = RecordingSink::new(format!("s{i}"));
                route_join(&registry, &join_request(&format!("u{i}"), "r1"), &sink)
                    .reply
                    .is_accept()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }

        let room = registry.get("r1").unwrap();
        let mut ids: Vec<String> = room.user_ids().into_iter().map(|u| u.into_inner()).collect();
        ids.sort();
        let mut expected: Vec<String> = (0..64).map(|i| format!("u{i}")).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joins_racing_reaper_never_land_in_retired_room() {
        let registry = Arc::new(RoomRegistry::default());
        let reaper = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..200 {
                    registry.reap_empty();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let sink: Arc<dyn ReplySink> = RecordingSink::new(format!("s{i}"));
                route_join(&registry, &join_request(&format!("u{i}"), "r1"), &sink)
                    .room
                    .map(|room| !room.is_retired())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some(true));
        }
        reaper.await.unwrap();
        assert_eq!(registry.get("r1").unwrap().len(), 32);
    }
}
