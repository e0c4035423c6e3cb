use serde::{Deserialize, Serialize};

/// Numeric error codes carried by a Reject reply.
///
/// The first four values are wire-compatible with existing deployments and must
/// not be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ErrorCode {
    Method = 1,
    Uid = 2,
    Sdp = 3,
    RoomId = 4,
    RoomNotEmpty = 5,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Upper-case name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Method => "METHOD_ERROR",
            Self::Uid => "UID_ERROR",
            Self::Sdp => "SDP_ERROR",
            Self::RoomId => "ROOMID_ERROR",
            Self::RoomNotEmpty => "ROOM_NOT_EMPTY",
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Method),
            2 => Ok(Self::Uid),
            3 => Ok(Self::Sdp),
            4 => Ok(Self::RoomId),
            5 => Ok(Self::RoomNotEmpty),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload fields the dispatcher validates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Uid,
    RoomId,
    Sdp,
}

impl Field {
    /// JSON key of the field in a request payload.
    pub fn key(self) -> &'static str {
        match self {
            Self::Uid => "uid",
            Self::RoomId => "roomId",
            Self::Sdp => "sdp",
        }
    }

    fn code(self) -> ErrorCode {
        match self {
            Self::Uid => ErrorCode::Uid,
            Self::RoomId => ErrorCode::RoomId,
            Self::Sdp => ErrorCode::Sdp,
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Errors produced while handling signaling messages.
///
/// Request-path errors are turned into a Reject at the room boundary; the same
/// variants surface as logged, ignored events on the notification path.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("{0} field does not exist")]
    MissingField(Field),
    #[error("{0} is not a string")]
    InvalidType(Field),
    #[error("uid {0} already exists")]
    UserExists(String),
    #[error("uid {0} doesn't exist")]
    UidNotFound(String),
    #[error("roomId {actual} does not match room {expected}")]
    RoomMismatch { expected: String, actual: String },
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("room {0} still has members")]
    RoomNotEmpty(String),
}

impl SignalError {
    /// Wire code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingField(field) | Self::InvalidType(field) => field.code(),
            Self::UserExists(_) | Self::UidNotFound(_) => ErrorCode::Uid,
            Self::RoomMismatch { .. } => ErrorCode::RoomId,
            Self::UnknownMethod(_) => ErrorCode::Method,
            Self::RoomNotEmpty(_) => ErrorCode::RoomNotEmpty,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidType(_) => "invalid_type",
            Self::UserExists(_) => "user_exists",
            Self::UidNotFound(_) => "uid_not_found",
            Self::RoomMismatch { .. } => "room_mismatch",
            Self::UnknownMethod(_) => "unknown_method",
            Self::RoomNotEmpty(_) => "room_not_empty",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(ErrorCode::Method.as_i32(), 1);
        assert_eq!(ErrorCode::Uid.as_i32(), 2);
        assert_eq!(ErrorCode::Sdp.as_i32(), 3);
        assert_eq!(ErrorCode::RoomId.as_i32(), 4);
        assert_eq!(ErrorCode::RoomNotEmpty.as_i32(), 5);
    }

    #[test]
    fn error_code_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&ErrorCode::Sdp).unwrap(), "3");
        let code: ErrorCode = serde_json::from_str("4").unwrap();
        assert_eq!(code, ErrorCode::RoomId);
        assert!(serde_json::from_str::<ErrorCode>("99").is_err());
    }

    #[test]
    fn field_errors_map_to_field_codes() {
        assert_eq!(SignalError::MissingField(Field::Uid).code(), ErrorCode::Uid);
        assert_eq!(SignalError::InvalidType(Field::Sdp).code(), ErrorCode::Sdp);
        assert_eq!(SignalError::MissingField(Field::RoomId).code(), ErrorCode::RoomId);
    }

    #[test]
    fn membership_errors_map_to_uid_code() {
        assert_eq!(SignalError::UserExists("a".into()).code(), ErrorCode::Uid);
        assert_eq!(SignalError::UidNotFound("a".into()).code(), ErrorCode::Uid);
    }

    #[test]
    fn room_and_method_codes() {
        let mismatch = SignalError::RoomMismatch {
            expected: "r1".into(),
            actual: "r2".into(),
        };
        assert_eq!(mismatch.code(), ErrorCode::RoomId);
        assert_eq!(SignalError::UnknownMethod("x".into()).code(), ErrorCode::Method);
        assert_eq!(SignalError::RoomNotEmpty("r1".into()).code(), ErrorCode::RoomNotEmpty);
    }

    #[test]
    fn messages_name_the_field() {
        assert_eq!(
            SignalError::MissingField(Field::Uid).to_string(),
            "uid field does not exist"
        );
        assert_eq!(
            SignalError::InvalidType(Field::RoomId).to_string(),
            "roomId is not a string"
        );
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(SignalError::UidNotFound("a".into()).error_kind(), "uid_not_found");
        assert_eq!(
            SignalError::RoomMismatch { expected: "a".into(), actual: "b".into() }.error_kind(),
            "room_mismatch"
        );
        assert_eq!(ErrorCode::RoomId.to_string(), "ROOMID_ERROR");
    }
}
