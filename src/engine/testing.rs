// src/engine/testing.rs
//! Scripted model and recording tool layer for in-crate tests

use crate::engine::config::AgentConfig;
use crate::engine::model::{ModelClient, ModelError, Transcript};
use crate::engine::reasoning::AgentEngine;
use crate::engine::tools::{ToolError, ToolLayer, ToolSpec};
use crate::protocol::message::TabMemoryPayload;
use crate::runtime::factory::EngineFactory;
use crate::utils::config::EngineSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Model that replays canned outputs in order
pub struct ScriptedModel {
    outputs: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedModel {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(Into::into).collect()),
            fallback: None,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Output returned once the script runs out
    pub fn with_fallback(mut self, output: impl Into<String>) -> Self {
        self.fallback = Some(output.into());
        self
    }

    /// Each invocation waits for one permit
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, _transcript: &Transcript) -> Result<String, ModelError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ModelError::Request(e.to_string()))?
                .forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outputs.lock().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or(ModelError::EmptyResponse)
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Tool layer that records every interaction
#[derive(Default)]
pub struct RecordingTools {
    results: HashMap<String, Result<String, ToolError>>,
    calls: Mutex<Vec<(String, Value)>>,
    tokens: Mutex<Vec<Option<String>>>,
    saved_pages: Mutex<Vec<TabMemoryPayload>>,
    resets: AtomicUsize,
    fail_auth: bool,
}

impl RecordingTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, tool: &str, result: Result<String, ToolError>) -> Self {
        self.results.insert(tool.to_string(), result);
        self
    }

    /// Make `set_auth_token` report a propagation failure
    pub fn failing_auth(mut self) -> Self {
        self.fail_auth = true;
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().clone()
    }

    pub fn saved_pages(&self) -> Vec<TabMemoryPayload> {
        self.saved_pages.lock().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolLayer for RecordingTools {
    async fn catalogue(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let mut names: Vec<&String> = self.results.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| ToolSpec::new(name.clone(), "", json!({"type": "object"})))
            .collect())
    }

    async fn execute(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        self.calls.lock().push((name.to_string(), arguments));
        self.results
            .get(name)
            .cloned()
            .unwrap_or_else(|| Ok(format!("{name} ok")))
    }

    async fn save_tab_memory(&self, page: &TabMemoryPayload) -> Result<Value, ToolError> {
        self.saved_pages.lock().push(page.clone());
        Ok(json!({"saved": true, "url": page.url}))
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), ToolError> {
        self.tokens.lock().push(token);
        if self.fail_auth {
            return Err(ToolError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing every session the same scripted model and tools
#[derive(Clone)]
pub struct FixedEngineFactory {
    pub model: Arc<ScriptedModel>,
    pub tools: Arc<RecordingTools>,
}

impl FixedEngineFactory {
    pub fn new(model: ScriptedModel, tools: RecordingTools) -> Self {
        Self {
            model: Arc::new(model),
            tools: Arc::new(tools),
        }
    }
}

impl EngineFactory for FixedEngineFactory {
    fn build(&self, config: &AgentConfig, settings: &EngineSettings) -> crate::utils::errors::Result<AgentEngine> {
        Ok(AgentEngine::new(
            config.processor,
            Arc::clone(&self.model) as Arc<dyn ModelClient>,
            Arc::clone(&self.tools) as Arc<dyn ToolLayer>,
            settings.clone(),
        ))
    }
}
