// src/engine/tools.rs
//! Tool layer interface
//!
//! Tools (mail, memory, page extraction) live behind an external tool
//! server. The reasoning loop sees them only through [`ToolLayer`].

use crate::protocol::message::TabMemoryPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    NotFound(String),

    #[error("tool '{tool}' failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("tool server transport error: {0}")]
    Transport(String),

    #[error("tool layer unavailable: {0}")]
    Unavailable(String),
}

/// Catalogue entry presented to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON-schema-like parameter description
    #[serde(default = "empty_schema", alias = "input_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object"})
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Model-supplied id, unique within one transcript
    pub id: String,

    pub name: String,

    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Default::default())
}

/// Tool-side capabilities of an agent engine
#[async_trait]
pub trait ToolLayer: Send + Sync {
    /// Tools the model may call
    async fn catalogue(&self) -> Result<Vec<ToolSpec>, ToolError>;

    /// Run one tool; the returned text becomes an observation
    async fn execute(&self, name: &str, arguments: Value) -> Result<String, ToolError>;

    /// Store a browser tab in agent memory
    async fn save_tab_memory(&self, page: &TabMemoryPayload) -> Result<Value, ToolError>;

    /// Replace (or drop, with `None`) the credential used for downstream
    /// tool connections and re-establish them
    async fn set_auth_token(&self, token: Option<String>) -> Result<(), ToolError>;

    /// Clear caches and connection state; keeps the credential
    async fn reset(&self);
}

/// Tool layer used when no tool server is configured
#[derive(Debug, Default)]
pub struct NoopToolLayer;

#[async_trait]
impl ToolLayer for NoopToolLayer {
    async fn catalogue(&self) -> Result<Vec<ToolSpec>, ToolError> {
        Ok(Vec::new())
    }

    async fn execute(&self, name: &str, _arguments: Value) -> Result<String, ToolError> {
        Err(ToolError::NotFound(name.to_string()))
    }

    async fn save_tab_memory(&self, _page: &TabMemoryPayload) -> Result<Value, ToolError> {
        Err(ToolError::Unavailable("no tool server configured".to_string()))
    }

    async fn set_auth_token(&self, _token: Option<String>) -> Result<(), ToolError> {
        Ok(())
    }

    async fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_defaults_arguments() {
        let call: ToolCall = serde_json::from_value(json!({"id": "c1", "name": "list_mail"})).unwrap();
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_spec_accepts_snake_case_schema() {
        let spec: ToolSpec = serde_json::from_value(json!({
            "name": "get_weather",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(spec.input_schema["properties"]["city"]["type"], "string");
        assert_eq!(spec.description, "");
    }

    #[tokio::test]
    async fn test_noop_layer() {
        let tools = NoopToolLayer;
        assert!(tools.catalogue().await.unwrap().is_empty());
        assert_eq!(
            tools.execute("anything", json!({})).await,
            Err(ToolError::NotFound("anything".into()))
        );
        assert!(tools.set_auth_token(None).await.is_ok());
    }
}
