//! Signaling wire format.
//!
//! Inbound frames are `{ id?, method, payload }`: a frame with an `id` is a
//! request and gets exactly one [`Reply`], a frame without one is a
//! notification. A frame with an `id` but no `method` answers a request the
//! server sent earlier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorCode, Field, SignalError};

/// Request expecting exactly one reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub payload: Value,
}

/// One-way message. Used in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }
}

/// Peer's answer to a request the server issued.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: String,
    pub data: Option<Value>,
    pub error_code: Option<i32>,
    pub error_message: Option<String>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.error_code.is_none()
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Terminal reply to a [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Reject {
        id: String,
        #[serde(rename = "errorCode")]
        error_code: ErrorCode,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
    Accept {
        id: String,
        data: Value,
    },
}

impl Reply {
    pub fn accept(id: impl Into<String>, data: Value) -> Self {
        Self::Accept {
            id: id.into(),
            data,
        }
    }

    pub fn reject(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Reject {
            id: id.into(),
            error_code: code,
            error_message: message.into(),
        }
    }

    pub fn from_error(id: impl Into<String>, err: &SignalError) -> Self {
        Self::reject(id, err.code(), err.to_string())
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Accept { id, .. } | Self::Reject { id, .. } => id,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Reject { error_code, .. } => Some(*error_code),
            Self::Accept { .. } => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Accept { data, .. } => Some(data),
            Self::Reject { .. } => None,
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no method")]
    MissingMethod { id: Option<String> },
    #[error("payload must be a JSON object")]
    PayloadNotObject { id: Option<String> },
    #[error("id must be a string or number, got {id}")]
    InvalidId { id: String },
}

impl ProtocolError {
    /// Request id recovered from the frame, if any. Lets the caller still
    /// reject a malformed request instead of leaving it unanswered.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::MissingMethod { id } | Self::PayloadNotObject { id } => id.as_deref(),
            Self::InvalidId { id } => Some(id),
            _ => None,
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Ids are strings on the wire; numeric ids from lenient clients are accepted
/// and echoed back in string form. A null id counts as absent. Any other
/// shape is an error carrying the id's JSON text so it can still be rejected.
fn id_from_value(value: Option<&Value>) -> Result<Option<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ProtocolError::InvalidId {
            id: other.to_string(),
        }),
    }
}

/// Decode one text frame.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut frame) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let id = id_from_value(frame.get("id"))?;
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let Some(method) = method else {
        // No method: only meaningful as a response to an earlier server request.
        let is_response = frame.contains_key("data") || frame.contains_key("errorCode");
        return match id {
            Some(id) if is_response => Ok(InboundMessage::Response(Response {
                id,
                data: frame.remove("data"),
                error_code: frame
                    .get("errorCode")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok()),
                error_message: frame
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            })),
            id => Err(ProtocolError::MissingMethod { id }),
        };
    };

    let payload = match frame.remove("payload") {
        None | Some(Value::Null) => empty_object(),
        Some(obj @ Value::Object(_)) => obj,
        Some(_) => return Err(ProtocolError::PayloadNotObject { id }),
    };

    Ok(match id {
        Some(id) => InboundMessage::Request(Request {
            id,
            method,
            payload,
        }),
        None => InboundMessage::Notification(Notification { method, payload }),
    })
}

/// Extract the `uid` field. An absent, non-string or empty uid is treated as
/// missing.
pub fn require_uid(payload: &Value) -> Result<&str, SignalError> {
    match payload.get(Field::Uid.key()).and_then(Value::as_str) {
        Some(uid) if !uid.is_empty() => Ok(uid),
        _ => Err(SignalError::MissingField(Field::Uid)),
    }
}

/// Extract a required string field.
pub fn require_str(payload: &Value, field: Field) -> Result<&str, SignalError> {
    match payload.get(field.key()) {
        None | Some(Value::Null) => Err(SignalError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(SignalError::InvalidType(field)),
    }
}
