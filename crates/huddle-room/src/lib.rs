//! Rooms and the registry that owns them.
//!
//! A [`Room`] keeps its members in join order behind its own lock and answers
//! `join`, `publish` and `close`. The [`RoomRegistry`] maps room ids to live
//! rooms; a room removed from it is retired and never accepts members again.

pub mod dispatcher;
pub mod registry;
pub mod room;
pub mod user;

pub use dispatcher::{dispatch_unbound, route_join, NotificationOutcome, RequestOutcome, Routed, CLOSE, JOIN, PUBLISH};
pub use registry::{RegistryStats, RoomCleanupPolicy, RoomRegistry};
pub use room::{Room, PEER_JOINED, PEER_LEFT};
pub use user::User;
