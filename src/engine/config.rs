// src/engine/config.rs
//! Agent configuration
//!
//! [`AgentConfigPayload`] is the wire shape of `initialize`; it is validated
//! once into an immutable [`AgentConfig`]. A new session replaces the
//! config, nothing mutates it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// A rejected configuration field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid agent config: '{field}' {reason}")]
pub struct ConfigError {
    /// Wire name of the offending field
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Which reasoning loop variant drives the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    /// One tool call per iteration
    #[default]
    React,
    /// Several coordinated tool calls per iteration
    Coact,
}

impl ProcessorKind {
    /// Unknown or missing values fall back to `react`
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("coact") => ProcessorKind::Coact,
            _ => ProcessorKind::React,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::React => "react",
            ProcessorKind::Coact => "coact",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `initialize` payload as sent over the wire
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_server_url: Option<String>,
}

impl fmt::Debug for AgentConfigPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfigPayload")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("processor_type", &self.processor_type)
            .field("openai_api_key", &redact(self.openai_api_key.as_deref()))
            .field("auth_token", &redact(self.auth_token.as_deref()))
            .field("tool_server_url", &self.tool_server_url)
            .finish()
    }
}

/// Validated, immutable agent configuration
#[derive(Clone, PartialEq)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub processor: ProcessorKind,
    pub api_key: String,
    pub auth_token: Option<String>,
    pub tool_server_url: Option<String>,
}

impl AgentConfig {
    /// Build a config with defaults for everything but the credential
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            processor: ProcessorKind::React,
            api_key: api_key.into(),
            auth_token: None,
            tool_server_url: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_processor(mut self, processor: ProcessorKind) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tool_server(mut self, url: impl Into<String>) -> Self {
        self.tool_server_url = Some(url.into());
        self
    }

    /// Validate a wire payload
    pub fn from_payload(payload: &AgentConfigPayload) -> Result<Self, ConfigError> {
        let api_key = payload
            .openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ConfigError::new("openaiApiKey", "is required and must not be blank"))?;

        let model = match payload.model.as_deref().map(str::trim) {
            None => DEFAULT_MODEL.to_string(),
            Some("") => return Err(ConfigError::new("model", "must not be blank")),
            Some(model) => model.to_string(),
        };

        let temperature = payload.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
            return Err(ConfigError::new(
                "temperature",
                format!("must be between 0 and {MAX_TEMPERATURE}, got {temperature}"),
            ));
        }

        let tool_server_url = match payload.tool_server_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| ConfigError::new("toolServerUrl", format!("is not a URL: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::new("toolServerUrl", "must use http or https"));
                }
                Some(url.to_string())
            }
        };

        let auth_token = payload
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Ok(Self {
            model,
            temperature,
            processor: ProcessorKind::parse_lenient(payload.processor_type.as_deref()),
            api_key: api_key.to_string(),
            auth_token,
            tool_server_url,
        })
    }

    /// Re-check invariants on a config built in code
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::from_payload(&self.to_payload()).map(|_| ())
    }

    pub fn to_payload(&self) -> AgentConfigPayload {
        AgentConfigPayload {
            model: Some(self.model.clone()),
            temperature: Some(self.temperature),
            processor_type: Some(self.processor.as_str().to_string()),
            openai_api_key: Some(self.api_key.clone()),
            auth_token: self.auth_token.clone(),
            tool_server_url: self.tool_server_url.clone(),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("processor", &self.processor)
            .field("api_key", &redact(Some(&self.api_key)))
            .field("auth_token", &redact(self.auth_token.as_deref()))
            .field("tool_server_url", &self.tool_server_url)
            .finish()
    }
}

fn redact(secret: Option<&str>) -> Option<&'static str> {
    secret.map(|_| "<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> AgentConfigPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_blank_key_cites_field() {
        let err = AgentConfig::from_payload(&payload(json!({
            "openaiApiKey": "",
            "model": "gpt-4o-mini"
        })))
        .unwrap_err();
        assert_eq!(err.field, "openaiApiKey");
        assert!(err.to_string().contains("openaiApiKey"));

        let err = AgentConfig::from_payload(&payload(json!({"openaiApiKey": "   "}))).unwrap_err();
        assert_eq!(err.field, "openaiApiKey");

        let err = AgentConfig::from_payload(&payload(json!({}))).unwrap_err();
        assert_eq!(err.field, "openaiApiKey");
    }

    #[test]
    fn test_defaults_applied() {
        let config = AgentConfig::from_payload(&payload(json!({"openaiApiKey": " sk-test "}))).unwrap();
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.processor, ProcessorKind::React);
        assert!(config.tool_server_url.is_none());
    }

    #[test]
    fn test_processor_falls_back_to_react() {
        assert_eq!(ProcessorKind::parse_lenient(Some("coact")), ProcessorKind::Coact);
        assert_eq!(ProcessorKind::parse_lenient(Some(" CoAct ")), ProcessorKind::Coact);
        assert_eq!(ProcessorKind::parse_lenient(Some("plan-and-solve")), ProcessorKind::React);
        assert_eq!(ProcessorKind::parse_lenient(None), ProcessorKind::React);
    }

    #[test]
    fn test_temperature_bounds() {
        for bad in [-0.1, 2.01] {
            let err = AgentConfig::from_payload(&payload(json!({
                "openaiApiKey": "sk-test",
                "temperature": bad
            })))
            .unwrap_err();
            assert_eq!(err.field, "temperature");
        }
        for good in [0.0, 1.0, 2.0] {
            assert!(AgentConfig::from_payload(&payload(json!({
                "openaiApiKey": "sk-test",
                "temperature": good
            })))
            .is_ok());
        }
    }

    #[test]
    fn test_tool_server_url_checked() {
        let err = AgentConfig::from_payload(&payload(json!({
            "openaiApiKey": "sk-test",
            "toolServerUrl": "ftp://tools.local"
        })))
        .unwrap_err();
        assert_eq!(err.field, "toolServerUrl");

        let config = AgentConfig::from_payload(&payload(json!({
            "openaiApiKey": "sk-test",
            "toolServerUrl": "http://127.0.0.1:3920/mcp",
            "authToken": "  "
        })))
        .unwrap();
        assert_eq!(config.tool_server_url.as_deref(), Some("http://127.0.0.1:3920/mcp"));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = AgentConfig::new("sk-secret-value");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret-value"));
        assert!(rendered.contains("<redacted>"));

        let rendered = format!("{:?}", config.to_payload());
        assert!(!rendered.contains("sk-secret-value"));
    }

    #[test]
    fn test_payload_round_trip_preserves_config() {
        let config = AgentConfig::new("sk-test")
            .with_model("gpt-4o")
            .with_processor(ProcessorKind::Coact)
            .with_temperature(0.2);
        let restored = AgentConfig::from_payload(&config.to_payload()).unwrap();
        assert_eq!(restored, config);
        assert!(config.validate().is_ok());
    }
}
