// src/protocol/events.rs
//! Stream event sub-types and the terminal chat outcome
//!
//! A `chat-stream` call produces, in order:
//!
//! ```text
//! thought / tool_call / observation ...   (zero or more)
//! chunk + done                            (final response)
//!   | done                                (iteration limit)
//!   | error                               (parse, model or runtime failure)
//! response                                (terminal, carries ChatOutcome)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental payload of a `stream` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thought {
        content: String,
        iteration: u32,
    },

    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        iteration: u32,
    },

    Observation {
        id: String,
        name: String,
        content: String,
        is_error: bool,
        iteration: u32,
    },

    /// Final answer text
    Chunk { content: String },

    /// Stream closed without failure
    Done { outcome: OutcomeKind, iterations: u32 },

    /// Stream closed by a failure
    Error { message: String },
}

impl StreamEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::Thought { .. } => "thought",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::Observation { .. } => "observation",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// `done` and `error` close the event stream
    pub fn closes_stream(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// The three ways a `chat-stream` call can end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    FinalResponse,
    Error,
    IterationLimitReached,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::FinalResponse => "final_response",
            OutcomeKind::Error => "error",
            OutcomeKind::IterationLimitReached => "iteration_limit_reached",
        }
    }
}

/// Result carried by the terminal `response` of a `chat-stream` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub outcome: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Model invocations performed
    pub iterations: u32,
}

impl ChatOutcome {
    pub fn success(&self) -> bool {
        self.outcome == OutcomeKind::FinalResponse
    }

    pub fn final_response(response: impl Into<String>, iterations: u32) -> Self {
        Self {
            outcome: OutcomeKind::FinalResponse,
            response: Some(response.into()),
            error: None,
            iterations,
        }
    }

    pub fn failed(error: impl Into<String>, iterations: u32) -> Self {
        Self {
            outcome: OutcomeKind::Error,
            response: None,
            error: Some(error.into()),
            iterations,
        }
    }

    pub fn iteration_limit(iterations: u32) -> Self {
        Self {
            outcome: OutcomeKind::IterationLimitReached,
            response: None,
            error: None,
            iterations,
        }
    }
}
