// src/engine/model.rs
//! Model client interface and the transcript it consumes
//!
//! Token-level inference is an external capability; the reasoning loop only
//! needs `invoke(transcript) -> text`.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model quota or rate limit exceeded: {0}")]
    QuotaExceeded(String),

    #[error("model returned no content")]
    EmptyResponse,

    #[error("failed to decode model response: {0}")]
    Decode(String),
}

/// One entry of the reasoning transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    System { content: String },
    User { content: String },
    /// Raw model output for one iteration (thoughts, tool calls, response)
    Model { content: String },
    /// Result of a tool call, failures included
    Observation {
        call_id: String,
        tool: String,
        content: String,
        is_error: bool,
    },
    /// Runtime note addressed to the model
    Note { content: String },
}

impl TranscriptEntry {
    /// Chat role used when sending this entry to a chat-completion API
    pub fn role(&self) -> &'static str {
        match self {
            TranscriptEntry::System { .. } => "system",
            TranscriptEntry::Model { .. } => "assistant",
            TranscriptEntry::User { .. }
            | TranscriptEntry::Observation { .. }
            | TranscriptEntry::Note { .. } => "user",
        }
    }

    /// Text as the model sees it
    pub fn render(&self) -> String {
        match self {
            TranscriptEntry::System { content }
            | TranscriptEntry::User { content }
            | TranscriptEntry::Model { content } => content.clone(),
            TranscriptEntry::Observation {
                call_id,
                tool,
                content,
                is_error,
            } => {
                let status = if *is_error { "error" } else { "ok" };
                format!(
                    "<observation id=\"{call_id}\" tool=\"{tool}\" status=\"{status}\">\n{content}\n</observation>"
                )
            }
            TranscriptEntry::Note { content } => format!("<note>{content}</note>"),
        }
    }
}

/// Ordered log of one reasoning session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Seed with the system prompt and the user question
    pub fn seeded(system_prompt: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            entries: vec![
                TranscriptEntry::System {
                    content: system_prompt.into(),
                },
                TranscriptEntry::User {
                    content: question.into(),
                },
            ],
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Observations recorded so far
    pub fn observation_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, TranscriptEntry::Observation { .. }))
            .count()
    }
}

/// Language model capability used by the reasoning loop
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Produce the next model output for the transcript
    async fn invoke(&self, transcript: &Transcript) -> Result<String, ModelError>;

    fn model_id(&self) -> &str;
}
