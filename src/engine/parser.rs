// src/engine/parser.rs
//! Model output parser
//!
//! Recognized segments:
//!
//! ```text
//! <thought>free text</thought>
//! <tool_call>{"id": "call_001", "name": "get_weather", "arguments": {...}}</tool_call>
//! <response>final answer</response>
//! ```
//!
//! A turn with none of these is a parse failure. Tool call ids must be
//! unique across the whole transcript.

use crate::engine::tools::ToolCall;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

static THOUGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<thought>(.*?)</thought>").expect("valid thought regex"));
static TOOL_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("valid tool_call regex"));
static RESPONSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<response>(.*?)</response>").expect("valid response regex"));

const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("model output contains no recognizable tag: {excerpt:?}")]
    NoRecognizedTag { excerpt: String },

    #[error("malformed tool call: {reason}")]
    InvalidToolCall { reason: String },

    #[error("duplicate tool call id '{0}'")]
    DuplicateCallId(String),
}

/// Segments extracted from one model output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTurn {
    pub thought: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub response: Option<String>,
}

impl ParsedTurn {
    /// Tool calls take precedence over a response in the same turn
    pub fn is_acting(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Thought text of a model output, even one that fails to parse as a whole
pub fn extract_thought(output: &str) -> Option<String> {
    let thoughts: Vec<&str> = THOUGHT_RE
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|t| !t.is_empty())
        .collect();
    (!thoughts.is_empty()).then(|| thoughts.join("\n"))
}

/// Parse one model output; `seen_ids` holds call ids already in the transcript
pub fn parse_turn(output: &str, seen_ids: &HashSet<String>) -> Result<ParsedTurn, ParseError> {
    let thought = extract_thought(output);

    let mut turn_ids = HashSet::new();
    let mut tool_calls = Vec::new();
    for captures in TOOL_CALL_RE.captures_iter(output) {
        let body = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let call = parse_tool_call(body)?;
        if seen_ids.contains(&call.id) || !turn_ids.insert(call.id.clone()) {
            return Err(ParseError::DuplicateCallId(call.id));
        }
        tool_calls.push(call);
    }

    let response = RESPONSE_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty());

    if thought.is_none() && tool_calls.is_empty() && response.is_none() {
        return Err(ParseError::NoRecognizedTag {
            excerpt: output.chars().take(EXCERPT_CHARS).collect(),
        });
    }

    Ok(ParsedTurn {
        thought,
        tool_calls,
        response,
    })
}

fn parse_tool_call(body: &str) -> Result<ToolCall, ParseError> {
    let call: ToolCall = serde_json::from_str(body).map_err(|e| ParseError::InvalidToolCall {
        reason: e.to_string(),
    })?;

    if call.id.trim().is_empty() {
        return Err(ParseError::InvalidToolCall {
            reason: "'id' must not be empty".to_string(),
        });
    }
    if call.name.trim().is_empty() {
        return Err(ParseError::InvalidToolCall {
            reason: "'name' must not be empty".to_string(),
        });
    }
    if !call.arguments.is_object() {
        return Err(ParseError::InvalidToolCall {
            reason: format!("arguments of '{}' must be an object", call.name),
        });
    }

    Ok(call)
}
