//! Shared types for the huddle signaling server: identifiers, the error
//! taxonomy, the wire protocol and the outbound [`ReplySink`] capability.

pub mod errors;
pub mod feedback;
pub mod ids;
pub mod protocol;

pub use errors::{ErrorCode, Field, SignalError};
pub use feedback::{Recorded, RecordingSink, ReplySink};
pub use ids::{RoomId, SessionKey, UserId};
pub use protocol::{parse_inbound, InboundMessage, Notification, ProtocolError, Reply, Request, Response};
