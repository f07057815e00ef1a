// src/runtime/factory.rs
//! Engine construction from a validated agent configuration

use crate::engine::config::AgentConfig;
use crate::engine::mcp::McpToolLayer;
use crate::engine::openai::OpenAiChatClient;
use crate::engine::reasoning::AgentEngine;
use crate::engine::tools::{NoopToolLayer, ToolLayer};
use crate::utils::config::EngineSettings;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::debug;

/// Builds the engine for an `initialize` request
pub trait EngineFactory: Send + Sync {
    fn build(&self, config: &AgentConfig, settings: &EngineSettings) -> Result<AgentEngine>;
}

/// OpenAI model client plus the configured tool server, if any
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEngineFactory;

impl EngineFactory for DefaultEngineFactory {
    fn build(&self, config: &AgentConfig, settings: &EngineSettings) -> Result<AgentEngine> {
        let model = OpenAiChatClient::new(config)?;

        let tools: Arc<dyn ToolLayer> = match &config.tool_server_url {
            Some(url) => Arc::new(McpToolLayer::new(url, config.auth_token.clone())?),
            None => Arc::new(NoopToolLayer),
        };

        debug!(
            model = %config.model,
            processor = %config.processor,
            tool_server = config.tool_server_url.is_some(),
            "Building agent engine"
        );

        Ok(AgentEngine::new(
            config.processor,
            Arc::new(model),
            tools,
            settings.clone(),
        ))
    }
}
