// src/engine/reasoning.rs
//! ReAct / CoAct reasoning loop
//!
//! A [`ReasoningRun`] is a lazy, finite, non-restartable sequence of
//! [`ReasoningEvent`]s ending in exactly one `Finished` event.
//!
//! ```text
//!          ┌──────────── Think ◀───────────┐
//!          │  invoke model (iteration += 1)│
//!          │  parse turn                   │
//!          ▼                               │
//!   tool calls? ──yes──▶ Act: execute, observe
//!          │no
//!   response? ──yes──▶ Finished(FinalResponse)
//!          │no
//!   thought only ──▶ Think again
//!
//!   iteration == max ──▶ Finished(IterationLimitReached)
//!   model / parse error ──▶ Finished(Failed)
//! ```
//!
//! Tool calls never count toward the ceiling; model invocations do.
//! ReAct executes one call per iteration, CoAct up to
//! `coact_max_tool_calls`, concurrently.

use crate::engine::config::ProcessorKind;
use crate::engine::model::{ModelClient, ModelError, Transcript, TranscriptEntry};
use crate::engine::parser::{extract_thought, parse_turn, ParseError};
use crate::engine::prompt::system_prompt;
use crate::engine::tools::{ToolCall, ToolLayer};
use crate::utils::config::EngineSettings;
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a run ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    FinalResponse(String),
    Failed(Failure),
    IterationLimitReached,
}

/// A tool result as recorded in the transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub call_id: String,
    pub tool: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningEvent {
    Thought { iteration: u32, text: String },
    ToolCall { iteration: u32, call: ToolCall },
    Observation { iteration: u32, observation: Observation },
    Finished { outcome: Outcome, iterations: u32 },
}

/// Per-message reasoning state; discarded when the run ends
#[derive(Debug)]
pub struct ReasoningState {
    pub transcript: Transcript,
    pub iteration: u32,
    pub finished: bool,
    seen_call_ids: HashSet<String>,
}

enum Phase {
    Think,
    Act(Vec<ToolCall>),
}

/// An initialized agent: model client, tool layer and loop limits
#[derive(Clone)]
pub struct AgentEngine {
    processor: ProcessorKind,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolLayer>,
    settings: EngineSettings,
}

impl AgentEngine {
    pub fn new(
        processor: ProcessorKind,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolLayer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            processor,
            model,
            tools,
            settings,
        }
    }

    pub fn processor(&self) -> ProcessorKind {
        self.processor
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub fn tools(&self) -> &Arc<dyn ToolLayer> {
        &self.tools
    }

    /// Tool calls executed per iteration
    pub fn max_tool_calls(&self) -> usize {
        match self.processor {
            ProcessorKind::React => 1,
            ProcessorKind::Coact => self.settings.coact_max_tool_calls.max(1),
        }
    }

    /// Start a run for one user message
    pub fn start(&self, question: impl Into<String>) -> ReasoningRun {
        ReasoningRun {
            engine: self.clone(),
            question: question.into(),
            state: None,
            phase: Phase::Think,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

/// One in-flight reasoning loop
pub struct ReasoningRun {
    engine: AgentEngine,
    question: String,
    state: Option<ReasoningState>,
    phase: Phase,
    pending: VecDeque<ReasoningEvent>,
    done: bool,
}

impl ReasoningRun {
    /// Next event, or `None` once `Finished` has been yielded
    pub async fn next_event(&mut self) -> Option<ReasoningEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.done {
                return None;
            }
            self.step().await;
        }
    }

    /// Model invocations so far
    pub fn iterations(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.iteration)
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.state.as_ref().map(|s| &s.transcript)
    }

    async fn step(&mut self) {
        if self.state.is_none() {
            self.state = Some(self.seed().await);
        }

        match std::mem::replace(&mut self.phase, Phase::Think) {
            Phase::Think => self.think().await,
            Phase::Act(calls) => self.act(calls).await,
        }
    }

    async fn seed(&self) -> ReasoningState {
        let catalogue = match self.engine.tools.catalogue().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!("Tool catalogue unavailable, continuing without tools: {}", e);
                Vec::new()
            }
        };
        let prompt = system_prompt(self.engine.processor, &catalogue, self.engine.max_tool_calls());

        debug!(
            processor = %self.engine.processor,
            tools = catalogue.len(),
            "Seeding reasoning transcript"
        );

        ReasoningState {
            transcript: Transcript::seeded(prompt, self.question.clone()),
            iteration: 0,
            finished: false,
            seen_call_ids: HashSet::new(),
        }
    }

    async fn think(&mut self) {
        let max_iterations = self.engine.settings.max_iterations;
        let Some(state) = self.state.as_mut() else {
            return;
        };

        if state.iteration >= max_iterations {
            info!(iterations = state.iteration, "Iteration limit reached without a response");
            self.finish(Outcome::IterationLimitReached);
            return;
        }

        state.iteration += 1;
        let iteration = state.iteration;
        metrics::counter!("agent_model_invocations_total").increment(1);
        debug!(iteration, "Invoking model");

        let output = match self.engine.model.invoke(&state.transcript).await {
            Ok(output) => output,
            Err(e) => {
                warn!(iteration, "Model invocation failed: {}", e);
                self.finish(Outcome::Failed(e.into()));
                return;
            }
        };

        state.transcript.push(TranscriptEntry::Model {
            content: output.clone(),
        });

        let turn = match parse_turn(&output, &state.seen_call_ids) {
            Ok(turn) => turn,
            Err(e) => {
                warn!(iteration, "Unparseable model output: {}", e);
                if let Some(text) = extract_thought(&output) {
                    self.pending.push_back(ReasoningEvent::Thought { iteration, text });
                }
                self.finish(Outcome::Failed(e.into()));
                return;
            }
        };

        if let Some(text) = turn.thought.clone() {
            self.pending.push_back(ReasoningEvent::Thought { iteration, text });
        }

        if turn.is_acting() {
            if turn.response.is_some() {
                debug!(iteration, "Ignoring response tag alongside tool calls");
            }

            let limit = self.engine.max_tool_calls();
            let mut calls = turn.tool_calls;
            for call in &calls {
                state.seen_call_ids.insert(call.id.clone());
            }

            let skipped = if calls.len() > limit {
                calls.split_off(limit)
            } else {
                Vec::new()
            };
            for call in &skipped {
                warn!(iteration, call_id = %call.id, tool = %call.name, "Tool call over batch limit skipped");
                state.transcript.push(TranscriptEntry::Note {
                    content: format!(
                        "Tool call '{}' ({}) was not executed: at most {} tool call(s) per reply.",
                        call.id, call.name, limit
                    ),
                });
            }

            for call in &calls {
                self.pending.push_back(ReasoningEvent::ToolCall {
                    iteration,
                    call: call.clone(),
                });
            }
            self.phase = Phase::Act(calls);
            return;
        }

        if let Some(answer) = turn.response {
            info!(iterations = iteration, "Reasoning produced a final response");
            self.finish(Outcome::FinalResponse(answer));
        }
    }

    async fn act(&mut self, calls: Vec<ToolCall>) {
        let iteration = self.iterations();
        let tools = Arc::clone(&self.engine.tools);
        let max_chars = self.engine.settings.max_observation_chars;

        let results = match self.engine.processor {
            ProcessorKind::React => {
                let mut results = Vec::with_capacity(calls.len());
                for call in &calls {
                    results.push(tools.execute(&call.name, call.arguments.clone()).await);
                }
                results
            }
            ProcessorKind::Coact => {
                join_all(
                    calls
                        .iter()
                        .map(|call| tools.execute(&call.name, call.arguments.clone())),
                )
                .await
            }
        };

        let Some(state) = self.state.as_mut() else {
            return;
        };

        for (call, result) in calls.into_iter().zip(results) {
            let (content, is_error) = match result {
                Ok(text) => {
                    metrics::counter!("agent_tool_calls_total", "status" => "ok").increment(1);
                    (truncate_chars(&text, max_chars), false)
                }
                Err(e) => {
                    metrics::counter!("agent_tool_calls_total", "status" => "error").increment(1);
                    warn!(iteration, call_id = %call.id, tool = %call.name, "Tool call failed: {}", e);
                    (format!("Error: {e}"), true)
                }
            };

            let observation = Observation {
                call_id: call.id,
                tool: call.name,
                content,
                is_error,
            };
            state.transcript.push(TranscriptEntry::Observation {
                call_id: observation.call_id.clone(),
                tool: observation.tool.clone(),
                content: observation.content.clone(),
                is_error,
            });
            self.pending.push_back(ReasoningEvent::Observation {
                iteration,
                observation,
            });
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        let iterations = self.iterations();
        if let Some(state) = self.state.as_mut() {
            state.finished = true;
        }
        self.done = true;
        self.pending.push_back(ReasoningEvent::Finished {
            outcome,
            iterations,
        });
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(&format!("\n[truncated {} chars]", total - max_chars));
    truncated
}
