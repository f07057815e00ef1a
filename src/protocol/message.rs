// src/protocol/message.rs
//! Message envelope and the closed set of request/reply variants
//!
//! Every message crossing the process boundary is
//! `{"id": string, "type": string, "data"?: object}`. Requests flow from
//! the supervisor to the runtime process; replies (`response`, `stream`,
//! `error`) flow back and carry the id of the request they answer.

use crate::engine::config::AgentConfigPayload;
use crate::protocol::events::StreamEvent;
use crate::utils::errors::ErrorCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reply type tags
pub const RESPONSE: &str = "response";
pub const STREAM: &str = "stream";
pub const ERROR: &str = "error";

/// Rejections raised before a message reaches a handler
///
/// These are logged and dropped; they are never answered on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message is missing string field '{0}'")]
    MissingField(&'static str),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("'{kind}' requires an object in 'data'")]
    DataNotAnObject { kind: String },

    #[error("invalid data for '{kind}': {reason}")]
    InvalidData { kind: String, reason: String },

    #[error("message exceeds {0} bytes")]
    Oversized(usize),
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
        }
    }

    /// Generate a fresh correlation id
    pub fn next_id() -> String {
        ulid::Ulid::new().to_string()
    }
}

/// The seven request kinds understood by the runtime process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Initialize,
    ChatStream,
    GetStatus,
    Reset,
    Ping,
    SaveTabMemory,
    UpdateAuthToken,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        RequestKind::Initialize,
        RequestKind::ChatStream,
        RequestKind::GetStatus,
        RequestKind::Reset,
        RequestKind::Ping,
        RequestKind::SaveTabMemory,
        RequestKind::UpdateAuthToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Initialize => "initialize",
            RequestKind::ChatStream => "chat-stream",
            RequestKind::GetStatus => "get-status",
            RequestKind::Reset => "reset",
            RequestKind::Ping => "ping",
            RequestKind::SaveTabMemory => "save-tab-memory",
            RequestKind::UpdateAuthToken => "update-auth-token",
        }
    }

    /// Health-probe traffic, kept out of verbose logs
    pub fn is_quiet(&self) -> bool {
        matches!(self, RequestKind::Ping)
    }

    /// Whether the request must carry an object in `data`
    pub fn requires_data(&self) -> bool {
        matches!(
            self,
            RequestKind::Initialize
                | RequestKind::ChatStream
                | RequestKind::SaveTabMemory
                | RequestKind::UpdateAuthToken
        )
    }
}

impl FromStr for RequestKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStreamPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp: i64,
}

/// A browser tab snapshot to be stored in agent memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabMemoryPayload {
    pub url: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokenPayload {
    /// `None` drops the credential from downstream tool connections
    #[serde(default)]
    pub token: Option<String>,
}

/// A validated inbound request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Initialize(AgentConfigPayload),
    ChatStream(ChatStreamPayload),
    GetStatus,
    Reset,
    Ping(PingPayload),
    SaveTabMemory(TabMemoryPayload),
    UpdateAuthToken(AuthTokenPayload),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Initialize(_) => RequestKind::Initialize,
            Request::ChatStream(_) => RequestKind::ChatStream,
            Request::GetStatus => RequestKind::GetStatus,
            Request::Reset => RequestKind::Reset,
            Request::Ping(_) => RequestKind::Ping,
            Request::SaveTabMemory(_) => RequestKind::SaveTabMemory,
            Request::UpdateAuthToken(_) => RequestKind::UpdateAuthToken,
        }
    }

    /// Validate an envelope into a request
    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let kind: RequestKind = message.kind.parse()?;

        let data = match &message.data {
            Some(Value::Object(_)) => message.data.clone(),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(ProtocolError::DataNotAnObject {
                    kind: kind.to_string(),
                })
            }
        };

        if kind.requires_data() && data.is_none() {
            return Err(ProtocolError::DataNotAnObject {
                kind: kind.to_string(),
            });
        }

        let request = match kind {
            RequestKind::Initialize => Request::Initialize(decode_data(kind, data)?),
            RequestKind::ChatStream => Request::ChatStream(decode_data(kind, data)?),
            RequestKind::GetStatus => Request::GetStatus,
            RequestKind::Reset => Request::Reset,
            RequestKind::Ping => Request::Ping(match data {
                Some(_) => decode_data(kind, data)?,
                None => PingPayload::default(),
            }),
            RequestKind::SaveTabMemory => Request::SaveTabMemory(decode_data(kind, data)?),
            RequestKind::UpdateAuthToken => Request::UpdateAuthToken(decode_data(kind, data)?),
        };

        Ok(request)
    }

    /// Encode as an envelope with the given correlation id
    pub fn into_message(self, id: impl Into<String>) -> Message {
        let kind = self.kind();
        let data = match self {
            Request::Initialize(payload) => serde_json::to_value(payload).ok(),
            Request::ChatStream(payload) => serde_json::to_value(payload).ok(),
            Request::GetStatus | Request::Reset => None,
            Request::Ping(payload) => serde_json::to_value(payload).ok(),
            Request::SaveTabMemory(payload) => serde_json::to_value(payload).ok(),
            Request::UpdateAuthToken(payload) => serde_json::to_value(payload).ok(),
        };
        Message::new(id, kind.as_str(), data)
    }
}

fn decode_data<T: DeserializeOwned>(
    kind: RequestKind,
    data: Option<Value>,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data.unwrap_or(Value::Null)).map_err(|e| ProtocolError::InvalidData {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Payload of a terminal `response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, result: Value) -> Self {
        Self {
            success: false,
            result,
            error: Some(error.into()),
        }
    }
}

/// Payload of a terminal `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Anything the runtime process sends back
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(ResponsePayload),
    Stream(StreamEvent),
    Error(ErrorPayload),
}

impl Reply {
    /// Terminal replies complete their call; stream events do not
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Reply::Stream(_))
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let data = message.data.clone().unwrap_or(Value::Null);
        let invalid = |e: serde_json::Error| ProtocolError::InvalidData {
            kind: message.kind.clone(),
            reason: e.to_string(),
        };

        match message.kind.as_str() {
            RESPONSE => serde_json::from_value(data).map(Reply::Response).map_err(invalid),
            STREAM => serde_json::from_value(data).map(Reply::Stream).map_err(invalid),
            ERROR => serde_json::from_value(data).map(Reply::Error).map_err(invalid),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn into_message(self, id: impl Into<String>) -> Message {
        let (kind, data) = match self {
            Reply::Response(payload) => (RESPONSE, serde_json::to_value(payload)),
            Reply::Stream(event) => (STREAM, serde_json::to_value(event)),
            Reply::Error(payload) => (ERROR, serde_json::to_value(payload)),
        };
        Message::new(id, kind, data.ok())
    }
}
