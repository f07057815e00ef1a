// src/engine/mod.rs
//! Agent reasoning engine
//!
//! - `config`: per-session agent configuration and its validation
//! - `model`: model client capability and the reasoning transcript
//! - `tools`: tool layer capability
//! - `parser`: tag parser for model output
//! - `prompt`: system prompt rendering
//! - `reasoning`: the ReAct / CoAct loop
//! - `openai`, `mcp`: production model client and tool layer

pub mod config;
pub mod mcp;
pub mod model;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod reasoning;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AgentConfig, AgentConfigPayload, ConfigError, ProcessorKind};
pub use mcp::McpToolLayer;
pub use model::{ModelClient, ModelError, Transcript, TranscriptEntry};
pub use openai::OpenAiChatClient;
pub use parser::{extract_thought, parse_turn, ParseError, ParsedTurn};
pub use reasoning::{AgentEngine, Failure, Observation, Outcome, ReasoningEvent, ReasoningRun};
pub use tools::{NoopToolLayer, ToolCall, ToolError, ToolLayer, ToolSpec};
